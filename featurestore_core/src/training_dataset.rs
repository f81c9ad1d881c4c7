//! Splitting of training data and retrieval-time transformations of the splits.
use std::sync::Arc;

use arrow::{
    array::{Array, ArrayRef, BooleanArray, Int64Array, RecordBatch, TimestampMicrosecondArray},
    compute::{cast, filter_record_batch},
    datatypes::{DataType, TimeUnit},
};
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, seq::SliceRandom, thread_rng, SeedableRng};

use crate::{
    transformation::{apply, TransformationContext, TransformationFunctionBinding, TransformationType},
    Error, Result,
};

/// Named share of the rows of a random split.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomSplit {
    pub name: String,
    /// Between 0 and 1.
    pub percentage: f64,
}

impl RandomSplit {
    pub fn new(name: impl Into<String>, percentage: f64) -> RandomSplit {
        RandomSplit {
            name: name.into(),
            percentage,
        }
    }
}

/// Rows whose event time is in `[start_time, end_time)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSeriesSplit {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl TimeSeriesSplit {
    pub fn new(
        name: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> TimeSeriesSplit {
        TimeSeriesSplit {
            name: name.into(),
            start_time,
            end_time,
        }
    }
}

/// Assign every row of `batch` to one of `splits` at random.
///
/// Each split gets `floor(rows * percentage)` rows and the last split also gets the remainder.
/// Rows keep their relative order within a split. Pass a `seed` for a reproducible assignment.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the percentages do not sum up to 1 or one of them is
/// outside of `[0, 1]`.
pub fn random_split(
    batch: &RecordBatch,
    splits: &[RandomSplit],
    seed: Option<u64>,
) -> Result<Vec<(String, RecordBatch)>> {
    let total: f64 = splits.iter().map(|s| s.percentage).sum();
    if splits.is_empty()
        || (total - 1.0).abs() > 1e-9
        || splits.iter().any(|s| !(0.0..=1.0).contains(&s.percentage))
    {
        return Err(Error::InvalidArgument(
            "sum of split ratios should be 1 and each value should be in range [0, 1]".to_owned(),
        ));
    }

    let num_rows = batch.num_rows();
    let mut groups = Vec::with_capacity(num_rows);
    for (i, split) in splits.iter().enumerate() {
        let size = (num_rows as f64 * split.percentage) as usize;
        groups.extend(std::iter::repeat(i).take(size.min(num_rows - groups.len())));
    }
    groups.resize(num_rows, splits.len() - 1);

    match seed {
        Some(seed) => groups.shuffle(&mut StdRng::seed_from_u64(seed)),
        None => groups.shuffle(&mut thread_rng()),
    }

    splits
        .iter()
        .enumerate()
        .map(|(i, split)| {
            let mask: BooleanArray = groups.iter().map(|g| Some(*g == i)).collect();
            Ok((split.name.clone(), filter_record_batch(batch, &mask)?))
        })
        .collect()
}

/// Select the rows of each split by the value of the `event_time` column.
///
/// The event time column may hold timestamps, dates or epoch milliseconds. Rows with a null event
/// time belong to no split. If `drop_event_time` the column is removed from the splits.
pub fn time_series_split(
    batch: &RecordBatch,
    splits: &[TimeSeriesSplit],
    event_time: &str,
    drop_event_time: bool,
) -> Result<Vec<(String, RecordBatch)>> {
    let (index, _) = batch.schema().column_with_name(event_time).ok_or_else(|| {
        Error::InvalidArgument(format!("event time column `{event_time}` is missing"))
    })?;
    let micros = event_time_micros(batch.column(index))?;

    splits
        .iter()
        .map(|split| {
            let start = split.start_time.timestamp_micros();
            let end = split.end_time.timestamp_micros();
            let mask: BooleanArray = micros
                .iter()
                .map(|t| Some(t.is_some_and(|t| start <= t && t < end)))
                .collect();
            let mut selected = filter_record_batch(batch, &mask)?;
            if drop_event_time {
                selected.remove_column(index);
            }
            Ok((split.name.clone(), selected))
        })
        .collect()
}

fn event_time_micros(column: &ArrayRef) -> Result<TimestampMicrosecondArray> {
    let micros = match column.data_type() {
        DataType::Int64 | DataType::Int32 | DataType::UInt32 | DataType::UInt64 => {
            let millis = cast(column, &DataType::Int64)?;
            let millis = millis
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| Error::Encoding("expected epoch milliseconds".to_owned()))?;
            let micros: Int64Array = millis
                .iter()
                .map(|t| t.and_then(|t| t.checked_mul(1000)))
                .collect();
            Arc::new(micros) as ArrayRef
        }
        _ => Arc::clone(column),
    };

    let timestamps = cast(&micros, &DataType::Timestamp(TimeUnit::Microsecond, None))?;
    timestamps
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .cloned()
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "event time column of type {} is not a point in time",
                column.data_type()
            ))
        })
}

/// Apply the model-dependent bindings to every split.
pub fn transform_splits(
    bindings: &[TransformationFunctionBinding],
    splits: Vec<(String, RecordBatch)>,
    context: Option<&TransformationContext>,
) -> Result<Vec<(String, RecordBatch)>> {
    let model_dependent: Vec<TransformationFunctionBinding> = bindings
        .iter()
        .filter(|b| b.transformation_type == TransformationType::ModelDependent)
        .cloned()
        .collect();
    if model_dependent.is_empty() {
        return Ok(splits);
    }

    splits
        .into_iter()
        .map(|(name, batch)| Ok((name, apply(&model_dependent, &batch, context)?)))
        .collect()
}
