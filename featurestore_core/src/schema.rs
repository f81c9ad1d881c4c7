//! Schema inference and reconciliation between dataframes and feature groups.
use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use arrow::{
    array::{make_array, new_null_array, Array, ArrayRef, AsArray, RecordBatch, RecordBatchOptions},
    compute::cast,
    datatypes::{DataType, Field, Schema},
};
use regex::Regex;

use crate::{
    feature::{arrow_type_from_offline, normalize_type, offline_type_from_arrow, Feature},
    feature_group::FeatureGroup,
    transformation::TransformationFunctionBinding,
    Error, Result,
};

const EMBEDDING_TYPES: [&str; 4] = ["array<int>", "array<bigint>", "array<float>", "array<double>"];

static UPPER_CASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[A-Z]").expect("upper case pattern should be valid"));
static VARCHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^varchar\((\d+)\)$").expect("varchar pattern should be valid"));

/// Feature store column naming: lower case, no spaces.
pub fn autofix_feature_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

/// Infer one feature per column of `batch`.
///
/// Column names are sanitized with [`autofix_feature_name`]. Columns of Arrow type `Null` take the
/// type of the declared feature with the same name, if any.
///
/// # Errors
///
/// Returns [`Error::SchemaInference`] naming the first column whose type has no feature store
/// counterpart.
pub fn infer_schema(batch: &RecordBatch, declared: Option<&[Feature]>) -> Result<Vec<Feature>> {
    let declared_types: HashMap<&str, &str> = declared
        .unwrap_or_default()
        .iter()
        .filter_map(|f| Some((f.name.as_str(), f.feature_type.as_deref()?)))
        .collect();

    batch
        .schema()
        .fields()
        .iter()
        .map(|field| {
            let name = autofix_feature_name(field.name());
            let feature_type = match field.data_type() {
                DataType::Null => declared_types.get(name.as_str()).map(|t| (*t).to_owned()),
                data_type => offline_type_from_arrow(data_type),
            };
            match feature_type {
                Some(feature_type) => Ok(Feature::new(name, feature_type)),
                None => Err(Error::SchemaInference {
                    reason: format!(
                        "column type {} cannot be mapped to a feature type",
                        field.data_type()
                    ),
                    feature: name,
                }),
            }
        })
        .collect()
}

/// Remove the features dropped by any binding and append one on-demand feature per binding output,
/// in binding order.
///
/// A feature sharing its name with an output is replaced by the output.
pub fn reconcile_on_demand(
    bindings: &[TransformationFunctionBinding],
    features: Vec<Feature>,
) -> Vec<Feature> {
    if bindings.is_empty() {
        return features;
    }

    let dropped: Vec<&str> = bindings
        .iter()
        .flat_map(|b| b.dropped_features.iter().map(String::as_str))
        .chain(bindings.iter().flat_map(|b| b.output_names()))
        .collect();

    features
        .into_iter()
        .filter(|f| !dropped.contains(&f.name.as_str()))
        .chain(bindings.iter().flat_map(|b| {
            b.outputs
                .iter()
                .map(|o| Feature::on_demand(o.name.clone(), o.feature_type.clone()))
        }))
        .collect()
}

/// Check that `incoming` features match the `existing` feature group schema by name and, where both
/// sides carry a type, by type.
///
/// Types are compared ignoring case and whitespace. Two struct types are not compared field by
/// field.
///
/// # Errors
///
/// Returns [`Error::SchemaMismatch`] listing every feature without a match.
pub fn verify_compatibility(existing: &[Feature], incoming: &[Feature]) -> Result<()> {
    let mut unmatched: Vec<&Feature> = incoming.iter().collect();
    let mut mismatches = Vec::new();

    for feature in existing {
        let Some(position) = unmatched.iter().position(|f| f.name == feature.name) else {
            mismatches.push(format!("{} (missing from dataframe)", feature.name));
            continue;
        };
        let other = unmatched.remove(position);

        if let (Some(fg_type), Some(df_type)) = (&feature.feature_type, &other.feature_type) {
            let fg_type = normalize_type(fg_type);
            let df_type = normalize_type(df_type);
            if fg_type != df_type && !(fg_type.starts_with("struct") && df_type.starts_with("struct"))
            {
                mismatches.push(format!("{} ({fg_type} != {df_type})", feature.name));
            }
        }
    }

    mismatches.extend(
        unmatched
            .into_iter()
            .map(|f| format!("{} (not in feature group)", f.name)),
    );

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(Error::SchemaMismatch { mismatches })
    }
}

/// Sanitize column names and turn timezone-aware timestamps into naive UTC timestamps.
pub fn normalize_dataframe(batch: &RecordBatch) -> Result<RecordBatch> {
    let schema = batch.schema();

    let upper_case_features: Vec<&str> = schema
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .filter(|name| UPPER_CASE.is_match(name))
        .collect();
    if !upper_case_features.is_empty() {
        log::warn!(target: "featurestore",
            "the ingested dataframe contains upper case letters in feature names: {upper_case_features:?}, feature names are sanitized to lower case in the feature store");
    }

    let space_features: Vec<&str> = schema
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .filter(|name| name.contains(' '))
        .collect();
    if !space_features.is_empty() {
        log::warn!(target: "featurestore",
            "the ingested dataframe contains feature names with spaces: {space_features:?}, feature names are sanitized to use underscore '_' in the feature store");
    }

    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns = Vec::with_capacity(schema.fields().len());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let column = match field.data_type() {
            DataType::Timestamp(unit, Some(_)) => relabel(column, DataType::Timestamp(*unit, None))?,
            _ => Arc::clone(column),
        };
        fields.push(Field::new(
            autofix_feature_name(field.name()),
            column.data_type().clone(),
            field.is_nullable(),
        ));
        columns.push(column);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        columns,
        &options,
    )?)
}

/// Cast `column` to `target`.
///
/// Timestamps keep their instant: a zone on either side is relabeled rather than resolved, and
/// naive timestamps are read as UTC.
pub(crate) fn cast_column(column: &ArrayRef, target: &DataType) -> Result<ArrayRef> {
    match (column.data_type(), target) {
        (source, target) if source == target => Ok(Arc::clone(column)),
        (DataType::Null, _) => Ok(new_null_array(target, column.len())),
        (DataType::Timestamp(source_unit, source_tz), DataType::Timestamp(unit, tz)) => {
            let naive = match source_tz {
                Some(_) => relabel(column, DataType::Timestamp(*source_unit, None))?,
                None => Arc::clone(column),
            };
            let naive = cast(&naive, &DataType::Timestamp(*unit, None))?;
            match tz {
                Some(_) => relabel(&naive, target.clone()),
                None => Ok(naive),
            }
        }
        _ => Ok(cast(column, target)?),
    }
}

/// Change the declared type of `array` without touching its values.
fn relabel(array: &ArrayRef, data_type: DataType) -> Result<ArrayRef> {
    let data = array.to_data().into_builder().data_type(data_type).build()?;
    Ok(make_array(data))
}

/// Check that embedding features have a vector type.
pub fn validate_embedding_features(embedding_features: &[String], features: &[Feature]) -> Result<()> {
    for name in embedding_features {
        let Some(feature_type) = features
            .iter()
            .find(|f| &f.name == name)
            .and_then(|f| f.feature_type.as_deref())
        else {
            continue;
        };
        if !EMBEDDING_TYPES.contains(&normalize_type(feature_type).as_str()) {
            return Err(Error::InvalidArgument(format!(
                "provided feature `{name}` has type `{feature_type}`, but requires one of the following: {}",
                EMBEDDING_TYPES.join(", ")
            )));
        }
    }
    Ok(())
}

/// Check that `batch` can be written to the online store of `fg`: primary key columns must be
/// present and non-null and strings must fit into their `varchar(n)` online type.
pub fn validate_online_schema(fg: &FeatureGroup, batch: &RecordBatch, features: &[Feature]) -> Result<()> {
    let schema = batch.schema();

    for key in &fg.primary_key {
        let Some((index, _)) = schema.column_with_name(key) else {
            return Err(Error::InvalidArgument(format!(
                "primary key column `{key}` is missing from the dataframe"
            )));
        };
        let nulls = batch.column(index).null_count();
        if nulls > 0 {
            return Err(Error::InvalidArgument(format!(
                "primary key column `{key}` contains {nulls} null values"
            )));
        }
    }

    for feature in features {
        let Some(limit) = feature
            .online_type
            .as_deref()
            .map(normalize_type)
            .and_then(|t| VARCHAR.captures(&t)?.get(1)?.as_str().parse::<usize>().ok())
        else {
            continue;
        };
        let Some(column) = batch.column_by_name(&feature.name) else {
            continue;
        };
        let longest = match column.data_type() {
            DataType::Utf8 => column.as_string::<i32>().iter().flatten().map(str::len).max(),
            DataType::LargeUtf8 => column.as_string::<i64>().iter().flatten().map(str::len).max(),
            _ => None,
        };
        if let Some(longest) = longest.filter(|l| *l > limit) {
            return Err(Error::InvalidArgument(format!(
                "feature `{}` has values of length {longest} exceeding its online type varchar({limit})",
                feature.name
            )));
        }
    }
    Ok(())
}

/// Arrange the columns of `batch` in the order of `features` and cast each to its feature's type.
///
/// Features without a column in `batch` are filled with nulls.
pub fn cast_to_schema(batch: &RecordBatch, features: &[Feature]) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(features.len());
    let mut columns = Vec::with_capacity(features.len());

    for feature in features {
        let feature_type = feature.feature_type.as_deref().ok_or_else(|| Error::SchemaInference {
            feature: feature.name.clone(),
            reason: "feature has no type".to_owned(),
        })?;
        let data_type = arrow_type_from_offline(feature_type).map_err(|_| Error::SchemaInference {
            feature: feature.name.clone(),
            reason: format!("unsupported feature type '{feature_type}'"),
        })?;

        let column = match batch.column_by_name(&feature.name) {
            Some(column) => cast_column(column, &data_type)?,
            None => new_null_array(&data_type, batch.num_rows()),
        };
        fields.push(Field::new(&feature.name, data_type, true));
        columns.push(column);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        columns,
        &options,
    )?)
}
