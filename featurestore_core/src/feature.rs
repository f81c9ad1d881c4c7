//! Features and the mapping between Arrow column types and feature store (Hive-style) types.
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Fields, TimeUnit};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single feature of a feature group schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub name: String,
    /// Offline type, e.g. `bigint` or `array<double>`. `None` until inferred from a dataframe.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub feature_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub foreign: bool,
    #[serde(default)]
    pub partition: bool,
    #[serde(default)]
    pub hudi_precombine_key: bool,
    #[serde(default)]
    pub on_demand: bool,
}

impl Feature {
    /// Create a feature with the given name and offline type.
    pub fn new(name: impl Into<String>, feature_type: impl Into<String>) -> Feature {
        Feature {
            name: name.into(),
            feature_type: Some(feature_type.into()),
            online_type: None,
            description: None,
            primary: false,
            foreign: false,
            partition: false,
            hudi_precombine_key: false,
            on_demand: false,
        }
    }

    /// Create a feature whose type is not known yet.
    pub fn untyped(name: impl Into<String>) -> Feature {
        Feature {
            feature_type: None,
            ..Feature::new(name, "")
        }
    }

    /// Create an on-demand feature, i.e. one computed by a transformation function at insertion
    /// time.
    pub fn on_demand(name: impl Into<String>, feature_type: impl Into<String>) -> Feature {
        Feature {
            on_demand: true,
            ..Feature::new(name, feature_type)
        }
    }

    /// Mark the feature as part of the primary key.
    pub fn with_primary(mut self) -> Feature {
        self.primary = true;
        self
    }

    /// Return `true` if the feature's value is nested (array, struct or map) and is encoded
    /// separately on the wire.
    pub fn is_complex(&self) -> bool {
        self.feature_type.as_deref().is_some_and(is_complex_type)
    }
}

/// Return `true` for array, struct and map types.
pub fn is_complex_type(feature_type: &str) -> bool {
    let t = normalize_type(feature_type);
    t.starts_with("array<") || t.starts_with("struct<") || t.starts_with("map<")
}

/// Lowercase a type string and strip all whitespace, so that `Array< Int >` and `array<int>`
/// compare equal.
pub fn normalize_type(feature_type: &str) -> String {
    feature_type
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Map an Arrow data type to a feature store offline type.
///
/// Returns `None` for `Null` and for types that have no offline counterpart.
pub fn offline_type_from_arrow(data_type: &DataType) -> Option<String> {
    let t = match data_type {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => "string".to_owned(),
        DataType::Binary | DataType::LargeBinary | DataType::BinaryView => "binary".to_owned(),
        DataType::Boolean => "boolean".to_owned(),
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::UInt8
        | DataType::UInt16 => "int".to_owned(),
        DataType::Int64 | DataType::UInt32 | DataType::UInt64 => "bigint".to_owned(),
        DataType::Float16 | DataType::Float32 => "float".to_owned(),
        DataType::Float64 => "double".to_owned(),
        DataType::Date32 | DataType::Date64 => "date".to_owned(),
        DataType::Timestamp(_, _) => "timestamp".to_owned(),
        DataType::Decimal128(precision, scale) => format!("decimal({precision},{scale})"),
        DataType::List(field)
        | DataType::LargeList(field)
        | DataType::FixedSizeList(field, _) => {
            format!("array<{}>", offline_type_from_arrow(field.data_type())?)
        }
        DataType::Struct(fields) => {
            let members = fields
                .iter()
                .map(|f| Some(format!("{}:{}", f.name(), offline_type_from_arrow(f.data_type())?)))
                .collect::<Option<Vec<_>>>()?;
            format!("struct<{}>", members.join(","))
        }
        DataType::Map(entries, _) => {
            let DataType::Struct(kv) = entries.data_type() else {
                return None;
            };
            let key = offline_type_from_arrow(kv.first()?.data_type())?;
            let value = offline_type_from_arrow(kv.get(1)?.data_type())?;
            format!("map<{key},{value}>")
        }
        DataType::Dictionary(_, value) => offline_type_from_arrow(value)?,
        _ => return None,
    };
    Some(t)
}

/// Zone of timestamp features, written as an offset.
pub const UTC_OFFSET: &str = "+00:00";

/// Map a feature store offline type to the Arrow data type used for casting and encoding.
///
/// Timestamps are always microsecond precision in UTC.
pub fn arrow_type_from_offline(feature_type: &str) -> Result<DataType> {
    let t = normalize_type(feature_type);
    parse_offline_type(&t).ok_or_else(|| Error::SchemaInference {
        feature: String::new(),
        reason: format!("unsupported feature type '{feature_type}'"),
    })
}

fn parse_offline_type(t: &str) -> Option<DataType> {
    let data_type = match t {
        "string" | "varchar" | "char" => DataType::Utf8,
        "binary" => DataType::Binary,
        "boolean" => DataType::Boolean,
        "tinyint" | "smallint" | "int" => DataType::Int32,
        "bigint" => DataType::Int64,
        "float" => DataType::Float32,
        "double" => DataType::Float64,
        "date" => DataType::Date32,
        "timestamp" => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC_OFFSET.into())),
        _ => {
            if let Some(inner) = strip_generic(t, "array") {
                let item = parse_offline_type(inner)?;
                DataType::List(Arc::new(Field::new("item", item, true)))
            } else if let Some(inner) = strip_generic(t, "struct") {
                let fields = split_top_level(inner, ',')
                    .into_iter()
                    .map(|member| {
                        let (name, member_type) = member.split_once(':')?;
                        Some(Field::new(name, parse_offline_type(member_type)?, true))
                    })
                    .collect::<Option<Vec<_>>>()?;
                DataType::Struct(Fields::from(fields))
            } else if let Some(inner) = strip_generic(t, "map") {
                let parts = split_top_level(inner, ',');
                let [key, value] = parts.as_slice() else {
                    return None;
                };
                let entries = Field::new(
                    "entries",
                    DataType::Struct(Fields::from(vec![
                        Field::new("keys", parse_offline_type(key)?, false),
                        Field::new("values", parse_offline_type(value)?, true),
                    ])),
                    false,
                );
                DataType::Map(Arc::new(entries), false)
            } else if let Some(inner) = t.strip_prefix("decimal(").and_then(|r| r.strip_suffix(')')) {
                let (precision, scale) = inner.split_once(',')?;
                DataType::Decimal128(precision.parse().ok()?, scale.parse().ok()?)
            } else {
                return None;
            }
        }
    };
    Some(data_type)
}

fn strip_generic<'a>(t: &'a str, name: &str) -> Option<&'a str> {
    t.strip_prefix(name)?.strip_prefix('<')?.strip_suffix('>')
}

/// Split on `separator` ignoring separators nested inside `<...>` or `(...)`.
fn split_top_level(s: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '<' | '(' => depth += 1,
            '>' | ')' => depth = depth.saturating_sub(1),
            c if c == separator && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}
