//! Feature group model.
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};

use crate::{
    collaborators::Job,
    feature::{arrow_type_from_offline, Feature},
    transformation::TransformationFunctionBinding,
    Error, Result,
};

/// How rows reach offline storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureGroupKind {
    /// Rows are uploaded as files and written by an ingestion job.
    #[default]
    Batch,
    /// Rows are published to the online topic and copied to offline storage by the
    /// materialization job.
    Streaming,
}

/// Table format used for offline storage. Time travel is only available for Hudi and Delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeTravelFormat {
    #[default]
    None,
    Hudi,
    Delta,
}

impl TimeTravelFormat {
    pub fn supports_time_travel(self) -> bool {
        matches!(self, TimeTravelFormat::Hudi | TimeTravelFormat::Delta)
    }
}

/// A named, versioned table-like schema plus its storage and ingestion configuration.
///
/// Created client-side and registered with the platform on first save. Registration fills in
/// [`FeatureGroup::id`], the online topic and the materialization job.
#[derive(Clone, Default)]
pub struct FeatureGroup {
    pub feature_store_id: i64,
    pub project_id: i64,
    /// Assigned by the platform on registration.
    pub id: Option<i64>,
    pub name: String,
    pub version: Option<i32>,
    pub description: Option<String>,
    pub features: Vec<Feature>,
    pub primary_key: Vec<String>,
    pub foreign_key: Vec<String>,
    pub partition_key: Vec<String>,
    pub hudi_precombine_key: Option<String>,
    pub event_time: Option<String>,
    pub online_enabled: bool,
    pub kind: FeatureGroupKind,
    pub time_travel_format: TimeTravelFormat,
    /// External feature groups have no offline backing managed by the platform.
    pub external: bool,
    /// Names of features indexed as embeddings.
    pub embedding_features: Vec<String>,
    pub transformation_functions: Vec<TransformationFunctionBinding>,
    pub subject_id: Option<i64>,
    pub online_topic_name: Option<String>,
    pub notification_topic_name: Option<String>,
    pub materialization_job: Option<Job>,
}

impl std::fmt::Debug for FeatureGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureGroup")
            .field("feature_store_id", &self.feature_store_id)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("features", &self.features)
            .field("kind", &self.kind)
            .field("time_travel_format", &self.time_travel_format)
            .field("online_enabled", &self.online_enabled)
            .finish_non_exhaustive()
    }
}

impl FeatureGroup {
    /// Create a new, unregistered feature group.
    pub fn new(feature_store_id: i64, name: impl Into<String>, version: Option<i32>) -> Self {
        FeatureGroup {
            feature_store_id,
            name: name.into(),
            version,
            ..FeatureGroup::default()
        }
    }

    /// Return `true` once the platform has assigned an id.
    pub fn is_registered(&self) -> bool {
        self.id.is_some()
    }

    /// Return `true` if rows are written through the online topic.
    pub fn writes_to_stream(&self) -> bool {
        self.kind == FeatureGroupKind::Streaming || (self.external && self.online_enabled)
    }

    /// Names of the features whose values are encoded separately before the row is encoded.
    pub fn complex_features(&self) -> Vec<&Feature> {
        self.features.iter().filter(|f| f.is_complex()).collect()
    }

    /// Topic the online ingestion pipeline reads from.
    pub fn online_topic(&self) -> Result<&str> {
        self.online_topic_name.as_deref().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "feature group '{}' has no online topic, save it before inserting",
                self.name
            ))
        })
    }

    /// Arrow schema matching the declared features, with every column nullable.
    pub fn arrow_schema(&self) -> Result<SchemaRef> {
        let fields = self
            .features
            .iter()
            .map(|feature| feature_field(feature, false))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(Schema::new(fields)))
    }

    /// Arrow schema of the row as it goes on the wire: complex features are replaced by the bytes
    /// of their own encoding.
    pub fn encoded_arrow_schema(&self) -> Result<SchemaRef> {
        let fields = self
            .features
            .iter()
            .map(|feature| feature_field(feature, true))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(Schema::new(fields)))
    }

    /// Copy primary, foreign, partition and precombine key flags from the feature group's key
    /// lists onto its features.
    pub fn apply_key_flags(&mut self) -> Result<()> {
        for (kind, keys) in [
            ("primary", &self.primary_key),
            ("foreign", &self.foreign_key),
            ("partition", &self.partition_key),
        ] {
            if let Some(missing) = keys
                .iter()
                .find(|key| !self.features.iter().any(|f| &f.name == *key))
            {
                return Err(Error::InvalidArgument(format!(
                    "provided {kind} key `{missing}` does not exist in feature group '{}'",
                    self.name
                )));
            }
        }

        for feature in &mut self.features {
            feature.primary = self.primary_key.contains(&feature.name);
            feature.foreign = self.foreign_key.contains(&feature.name);
            feature.partition = self.partition_key.contains(&feature.name);
            feature.hudi_precombine_key =
                self.hudi_precombine_key.as_deref() == Some(feature.name.as_str());
        }
        Ok(())
    }
}

fn feature_field(feature: &Feature, encoded: bool) -> Result<Field> {
    let Some(feature_type) = feature.feature_type.as_deref() else {
        return Err(Error::SchemaInference {
            feature: feature.name.clone(),
            reason: "feature has no type".to_owned(),
        });
    };
    let data_type = if encoded && feature.is_complex() {
        DataType::Binary
    } else {
        arrow_type_from_offline(feature_type).map_err(|_| Error::SchemaInference {
            feature: feature.name.clone(),
            reason: format!("unsupported feature type '{feature_type}'"),
        })?
    };
    Ok(Field::new(&feature.name, data_type, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature_group() -> FeatureGroup {
        FeatureGroup {
            features: vec![
                Feature::new("id", "bigint"),
                Feature::new("embedding", "array<double>"),
                Feature::new("ts", "timestamp"),
            ],
            primary_key: vec!["id".to_owned()],
            ..FeatureGroup::new(1, "fg", Some(1))
        }
    }

    #[test]
    fn encoded_schema_replaces_complex_features_with_bytes() {
        let fg = feature_group();

        let schema = fg.arrow_schema().unwrap();
        assert!(matches!(
            schema.field_with_name("embedding").unwrap().data_type(),
            DataType::List(_)
        ));

        let encoded = fg.encoded_arrow_schema().unwrap();
        assert_eq!(
            encoded.field_with_name("embedding").unwrap().data_type(),
            &DataType::Binary
        );
        assert_eq!(encoded.field_with_name("id").unwrap().data_type(), &DataType::Int64);
        assert_eq!(
            fg.complex_features()
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>(),
            vec!["embedding"]
        );
    }

    #[test]
    fn key_flags_are_applied() {
        let mut fg = feature_group();
        fg.hudi_precombine_key = Some("ts".to_owned());

        fg.apply_key_flags().unwrap();

        assert!(fg.features[0].primary);
        assert!(!fg.features[1].primary);
        assert!(fg.features[2].hudi_precombine_key);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut fg = feature_group();
        fg.partition_key = vec!["day".to_owned()];

        let err = fg.apply_key_flags().unwrap_err();

        assert!(err.to_string().contains("partition key `day`"));
    }

    #[test]
    fn stream_dispatch() {
        let mut fg = feature_group();
        assert!(!fg.writes_to_stream());

        fg.external = true;
        fg.online_enabled = true;
        assert!(fg.writes_to_stream());

        fg.external = false;
        fg.kind = FeatureGroupKind::Streaming;
        assert!(fg.writes_to_stream());
    }
}
