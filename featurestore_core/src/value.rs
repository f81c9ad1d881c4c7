use std::sync::Arc;

use arrow::{
    array::{
        Array, ArrayRef, AsArray, BinaryBuilder, BooleanBuilder, Date32Builder, Float32Builder,
        Float64Builder, Int32Builder, Int64Builder, StringBuilder, TimestampMicrosecondBuilder,
    },
    datatypes::{
        DataType, Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
        Int8Type, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
        TimestampNanosecondType, TimestampSecondType, UInt16Type, UInt32Type, UInt64Type,
        UInt8Type,
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single cell value handed to and returned from row-wise transformation functions.
///
/// Conveniently implements `From` conversions for common scalar types.
///
/// ```
/// # use featurestore_core::FeatureValue;
/// let amount: FeatureValue = 12.5.into();
/// let city: FeatureValue = "Stockholm".into();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Null or absent value.
    #[from(ignore)]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    #[from(ignore)]
    Binary(Vec<u8>),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    List(Vec<FeatureValue>),
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        FeatureValue::String(value.to_owned())
    }
}

impl From<i32> for FeatureValue {
    fn from(value: i32) -> Self {
        FeatureValue::Int(value.into())
    }
}

impl<T: Into<FeatureValue>> From<Option<T>> for FeatureValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FeatureValue::Null, Into::into)
    }
}

impl FeatureValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FeatureValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FeatureValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as `f64`, converting integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Float(f) => Some(*f),
            FeatureValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read the value at `row` of `array`.
    pub fn from_array(array: &dyn Array, row: usize) -> Result<FeatureValue> {
        if array.is_null(row) {
            return Ok(FeatureValue::Null);
        }
        let value = match array.data_type() {
            DataType::Null => FeatureValue::Null,
            DataType::Boolean => FeatureValue::Bool(array.as_boolean().value(row)),
            DataType::Int8 => FeatureValue::Int(array.as_primitive::<Int8Type>().value(row).into()),
            DataType::Int16 => FeatureValue::Int(array.as_primitive::<Int16Type>().value(row).into()),
            DataType::Int32 => array.as_primitive::<Int32Type>().value(row).into(),
            DataType::Int64 => array.as_primitive::<Int64Type>().value(row).into(),
            DataType::UInt8 => FeatureValue::Int(array.as_primitive::<UInt8Type>().value(row).into()),
            DataType::UInt16 => {
                FeatureValue::Int(array.as_primitive::<UInt16Type>().value(row).into())
            }
            DataType::UInt32 => {
                FeatureValue::Int(array.as_primitive::<UInt32Type>().value(row).into())
            }
            DataType::UInt64 => {
                let value = array.as_primitive::<UInt64Type>().value(row);
                FeatureValue::Int(i64::try_from(value).map_err(|_| {
                    Error::Encoding(format!("value {value} does not fit into a bigint"))
                })?)
            }
            DataType::Float32 => {
                FeatureValue::Float(array.as_primitive::<Float32Type>().value(row).into())
            }
            DataType::Float64 => array.as_primitive::<Float64Type>().value(row).into(),
            DataType::Utf8 => array.as_string::<i32>().value(row).into(),
            DataType::LargeUtf8 => array.as_string::<i64>().value(row).into(),
            DataType::Binary => FeatureValue::Binary(array.as_binary::<i32>().value(row).to_vec()),
            DataType::LargeBinary => {
                FeatureValue::Binary(array.as_binary::<i64>().value(row).to_vec())
            }
            DataType::Date32 => array
                .as_primitive::<Date32Type>()
                .value_as_date(row)
                .map_or(FeatureValue::Null, FeatureValue::Date),
            DataType::Timestamp(unit, _) => {
                let micros = match unit {
                    TimeUnit::Second => array
                        .as_primitive::<TimestampSecondType>()
                        .value(row)
                        .saturating_mul(1_000_000),
                    TimeUnit::Millisecond => array
                        .as_primitive::<TimestampMillisecondType>()
                        .value(row)
                        .saturating_mul(1_000),
                    TimeUnit::Microsecond => {
                        array.as_primitive::<TimestampMicrosecondType>().value(row)
                    }
                    TimeUnit::Nanosecond => {
                        array.as_primitive::<TimestampNanosecondType>().value(row) / 1_000
                    }
                };
                DateTime::from_timestamp_micros(micros)
                    .map_or(FeatureValue::Null, FeatureValue::Timestamp)
            }
            DataType::List(_) => {
                let values = array.as_list::<i32>().value(row);
                FeatureValue::List(
                    (0..values.len())
                        .map(|i| FeatureValue::from_array(values.as_ref(), i))
                        .collect::<Result<_>>()?,
                )
            }
            other => {
                return Err(Error::Encoding(format!(
                    "values of type {other} are not supported in row-wise transformations"
                )))
            }
        };
        Ok(value)
    }
}

/// Build an Arrow array of `data_type` from row-wise transformation outputs.
pub fn build_array(data_type: &DataType, values: &[FeatureValue]) -> Result<ArrayRef> {
    fn mismatch(data_type: &DataType, value: &FeatureValue) -> Error {
        Error::Encoding(format!(
            "transformation returned {value:?} for an output declared as {data_type}"
        ))
    }

    macro_rules! build {
        ($builder:expr, $extract:expr) => {{
            let mut builder = $builder;
            for value in values {
                if value.is_null() {
                    builder.append_null();
                } else {
                    let extracted = $extract(value).ok_or_else(|| mismatch(data_type, value))?;
                    builder.append_value(extracted);
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }};
    }

    let array = match data_type {
        DataType::Boolean => build!(BooleanBuilder::new(), |v: &FeatureValue| match v {
            FeatureValue::Bool(b) => Some(*b),
            _ => None,
        }),
        DataType::Int32 => build!(Int32Builder::new(), |v: &FeatureValue| v
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())),
        DataType::Int64 => build!(Int64Builder::new(), |v: &FeatureValue| v.as_i64()),
        DataType::Float32 => build!(Float32Builder::new(), |v: &FeatureValue| v
            .as_f64()
            .map(|f| f as f32)),
        DataType::Float64 => build!(Float64Builder::new(), |v: &FeatureValue| v.as_f64()),
        DataType::Utf8 => build!(StringBuilder::new(), |v: &FeatureValue| v
            .as_str()
            .map(str::to_owned)),
        DataType::Binary => build!(BinaryBuilder::new(), |v: &FeatureValue| match v {
            FeatureValue::Binary(b) => Some(b.clone()),
            _ => None,
        }),
        DataType::Date32 => build!(Date32Builder::new(), |v: &FeatureValue| match v {
            FeatureValue::Date(d) => Some(Date32Type::from_naive_date(*d)),
            _ => None,
        }),
        DataType::Timestamp(TimeUnit::Microsecond, tz) => build!(
            TimestampMicrosecondBuilder::new().with_timezone_opt(tz.clone()),
            |v: &FeatureValue| match v {
                FeatureValue::Timestamp(ts) => Some(ts.timestamp_micros()),
                _ => None,
            }
        ),
        other => {
            return Err(Error::Encoding(format!(
                "row-wise transformation outputs of type {other} are not supported, use a vectorized transformation"
            )))
        }
    };
    Ok(array)
}

#[cfg(test)]
mod tests {
    use arrow::array::{Int64Array, ListArray, StringArray};
    use arrow::datatypes::Int64Type as I64;

    use super::*;

    #[test]
    fn reads_values_from_arrays() {
        let ints = Int64Array::from(vec![Some(1), None]);
        assert_eq!(FeatureValue::from_array(&ints, 0).unwrap(), FeatureValue::Int(1));
        assert_eq!(FeatureValue::from_array(&ints, 1).unwrap(), FeatureValue::Null);

        let strings = StringArray::from(vec!["a"]);
        assert_eq!(FeatureValue::from_array(&strings, 0).unwrap(), "a".into());

        let lists = ListArray::from_iter_primitive::<I64, _, _>(vec![Some(vec![Some(1), Some(2)])]);
        assert_eq!(
            FeatureValue::from_array(&lists, 0).unwrap(),
            FeatureValue::List(vec![FeatureValue::Int(1), FeatureValue::Int(2)])
        );
    }

    #[test]
    fn builds_arrays_of_declared_type() {
        let array = build_array(
            &DataType::Float64,
            &[FeatureValue::Int(1), FeatureValue::Null, FeatureValue::Float(2.5)],
        )
        .unwrap();

        let array = array.as_primitive::<Float64Type>();
        assert_eq!(array.len(), 3);
        assert_eq!(array.value(0), 1.0);
        assert!(array.is_null(1));
        assert_eq!(array.value(2), 2.5);
    }

    #[test]
    fn rejects_mismatched_outputs() {
        let err = build_array(&DataType::Int64, &["nope".into()]).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }
}
