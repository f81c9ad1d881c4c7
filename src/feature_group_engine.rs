use std::sync::Arc;

use arrow::array::RecordBatch;
use chrono::{DateTime, Utc};

use featurestore_core::{
    collaborators::{Commit, Job, MetadataUpdate, NoValidation, ValidationGate, ValidationReport},
    delivery::{kafka::KafkaBroker, Broker},
    feature_group::TimeTravelFormat,
    schema::{
        infer_schema, normalize_dataframe, reconcile_on_demand, validate_embedding_features,
        validate_online_schema, verify_compatibility,
    },
    session::IngestionSession,
    transformation::{self, TransformationContext},
    write_options::WriteOptions,
    Error, Feature, FeatureGroup, Result,
};

use crate::{write_engine::writer_for, Platform};

/// Storage an insert targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Online,
    Offline,
}

/// Data validation settings of a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Run the feature group's expectations before writing.
    pub run_validation: bool,
    /// Check primary keys and string lengths of online-enabled feature groups.
    pub online_schema_validation: bool,
}

impl Default for ValidationOptions {
    fn default() -> ValidationOptions {
        ValidationOptions {
            run_validation: true,
            online_schema_validation: true,
        }
    }
}

/// Options of [`FeatureGroupEngine::insert`].
///
/// ```
/// # use featurestore::feature_group_engine::{InsertOptions, Storage};
/// let insert = InsertOptions::new()
///     .with_overwrite(true)
///     .with_storage(Storage::Offline);
/// assert!(insert.transform);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InsertOptions<'a> {
    /// Delete the feature group's data before writing.
    pub overwrite: bool,
    pub storage: Option<Storage>,
    /// Apply on-demand transformation functions. Defaults to `true`.
    pub transform: bool,
    pub transformation_context: Option<&'a TransformationContext>,
    pub validation: ValidationOptions,
}

impl<'a> InsertOptions<'a> {
    pub fn new() -> InsertOptions<'a> {
        InsertOptions {
            transform: true,
            ..InsertOptions::default()
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> InsertOptions<'a> {
        self.overwrite = overwrite;
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> InsertOptions<'a> {
        self.storage = Some(storage);
        self
    }

    pub fn with_transform(mut self, transform: bool) -> InsertOptions<'a> {
        self.transform = transform;
        self
    }

    pub fn with_transformation_context(
        mut self,
        context: &'a TransformationContext,
    ) -> InsertOptions<'a> {
        self.transformation_context = Some(context);
        self
    }

    pub fn with_validation(mut self, validation: ValidationOptions) -> InsertOptions<'a> {
        self.validation = validation;
        self
    }
}

/// Result of a write: the job moving rows to offline storage and the validation report.
pub type WriteResult = (Option<Job>, Option<ValidationReport>);

/// Orchestrates writes into feature groups: schema reconciliation, transformations, validation,
/// registration and the actual write.
pub struct FeatureGroupEngine<P> {
    platform: Arc<P>,
    broker: Arc<dyn Broker>,
    validation: Arc<dyn ValidationGate>,
    external_client: bool,
}

impl<P: Platform> FeatureGroupEngine<P> {
    /// An engine publishing through Kafka, without data validation, for a client running outside
    /// of the platform.
    pub fn new(platform: Arc<P>) -> FeatureGroupEngine<P> {
        FeatureGroupEngine {
            platform,
            broker: Arc::new(KafkaBroker),
            validation: Arc::new(NoValidation),
            external_client: true,
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> FeatureGroupEngine<P> {
        self.broker = broker;
        self
    }

    pub fn with_validation(mut self, validation: Arc<dyn ValidationGate>) -> FeatureGroupEngine<P> {
        self.validation = validation;
        self
    }

    pub fn with_external_client(mut self, external: bool) -> FeatureGroupEngine<P> {
        self.external_client = external;
        self
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Register `fg` with the schema of `batch` and write `batch` into it.
    ///
    /// A dataframe rejected by data validation is not written, and `(None, Some(report))` is
    /// returned.
    pub fn save(
        &self,
        fg: &mut FeatureGroup,
        batch: &RecordBatch,
        options: &WriteOptions,
        validation: ValidationOptions,
    ) -> Result<WriteResult> {
        let mut batch = normalize_dataframe(batch)?;
        let features = infer_schema(&batch, None)?;
        let features = reconcile_on_demand(&fg.transformation_functions, features);

        if !fg.transformation_functions.is_empty() {
            if fg.external {
                log::warn!(target: "featurestore", feature_group = fg.name.as_str();
                    "on-demand features were not created, external feature groups do not support on-demand transformations");
            } else {
                batch = transformation::apply(&fg.transformation_functions, &batch, None)?;
            }
        }

        self.validate_features(fg, &batch, &features, validation)?;
        self.save_feature_group_metadata(fg, features)?;

        let report = self.run_validation(fg, &batch, validation)?;
        if report.as_ref().is_some_and(ValidationReport::is_rejected) {
            log::warn!(target: "featurestore", feature_group = fg.name.as_str();
                "dataframe rejected by data validation, nothing was written");
            return Ok((None, report));
        }

        let job = writer_for(fg, &*self.platform, &*self.broker, self.external_client)
            .save(fg, &batch, options, None)?;
        Ok((job, report))
    }

    /// Write `batch` into `fg`, registering the feature group first if it is new.
    ///
    /// `session` carries the producer of a multi-part insert across calls.
    ///
    /// # Errors
    ///
    /// - [`Error::SchemaMismatch`] if `batch` does not match the schema of a registered feature
    ///   group. Nothing is written.
    /// - [`Error::ValidationRejected`] if data validation rejected `batch`.
    /// - [`Error::InvalidArgument`] if online storage is requested for a feature group that is not
    ///   online-enabled.
    pub fn insert(
        &self,
        fg: &mut FeatureGroup,
        batch: &RecordBatch,
        insert: &InsertOptions<'_>,
        options: &WriteOptions,
        session: Option<&mut IngestionSession>,
    ) -> Result<WriteResult> {
        let mut batch = normalize_dataframe(batch)?;
        let mut features = infer_schema(&batch, Some(&fg.features))?;

        if !fg.external && !fg.transformation_functions.is_empty() && insert.transform {
            batch = transformation::apply(
                &fg.transformation_functions,
                &batch,
                insert.transformation_context,
            )?;
            features = reconcile_on_demand(&fg.transformation_functions, features);
        }

        self.validate_features(fg, &batch, &features, insert.validation)?;

        if fg.is_registered() {
            verify_compatibility(&fg.features, &features)?;
        } else {
            self.save_feature_group_metadata(fg, features)?;
        }

        let report = self.run_validation(fg, &batch, insert.validation)?;
        if let Some(report) = report.as_ref().filter(|r| r.is_rejected()) {
            return Err(Error::ValidationRejected {
                feature_group: fg.name.clone(),
                report_url: report.url.clone(),
            });
        }

        if insert.storage == Some(Storage::Online) && !fg.online_enabled {
            return Err(Error::InvalidArgument(format!(
                "online storage is not enabled for feature group '{}'",
                fg.name
            )));
        }

        if insert.overwrite {
            log::debug!(target: "featurestore", feature_group = fg.name.as_str(); "deleting feature group content");
            self.platform.delete_content(fg)?;
        }

        let job = writer_for(fg, &*self.platform, &*self.broker, self.external_client)
            .save(fg, &batch, options, session)?;
        Ok((job, report))
    }

    /// Continuous ingestion from an unbounded source.
    pub fn insert_stream(&self, fg: &FeatureGroup) -> Result<()> {
        Err(Error::Unsupported(format!(
            "insert_stream into feature group '{}' requires a streaming execution engine",
            fg.name
        )))
    }

    /// Delete the rows of `fg` whose primary keys are listed in `keys`.
    pub fn delete_records(&self, fg: &FeatureGroup, keys: &RecordBatch) -> Result<()> {
        writer_for(fg, &*self.platform, &*self.broker, self.external_client)
            .delete_record(fg, keys)
    }

    pub fn vacuum(&self, fg: &FeatureGroup, retention_hours: Option<u32>) -> Result<()> {
        writer_for(fg, &*self.platform, &*self.broker, self.external_client)
            .vacuum(fg, retention_hours)
    }

    /// Replace the features of `fg` having the same name as one of `updated`.
    pub fn update_features(&self, fg: &mut FeatureGroup, updated: &[Feature]) -> Result<()> {
        let features = fg
            .features
            .iter()
            .map(|f| {
                updated
                    .iter()
                    .find(|u| u.name == f.name)
                    .unwrap_or(f)
                    .clone()
            })
            .collect();
        self.update_metadata(fg, |copy| copy.features = features, MetadataUpdate::Metadata)
    }

    /// Append `new_features` to the schema of `fg`.
    pub fn append_features(&self, fg: &mut FeatureGroup, new_features: &[Feature]) -> Result<()> {
        if let Some(duplicate) = new_features
            .iter()
            .find(|n| fg.features.iter().any(|f| f.name == n.name))
        {
            return Err(Error::InvalidArgument(format!(
                "feature '{}' already exists in feature group '{}'",
                duplicate.name, fg.name
            )));
        }
        let features = fg.features.iter().chain(new_features).cloned().collect();
        self.update_metadata(fg, |copy| copy.features = features, MetadataUpdate::Metadata)
    }

    pub fn update_description(&self, fg: &mut FeatureGroup, description: &str) -> Result<()> {
        let description = description.to_owned();
        self.update_metadata(
            fg,
            |copy| copy.description = Some(description),
            MetadataUpdate::Metadata,
        )
    }

    pub fn update_notification_topic_name(
        &self,
        fg: &mut FeatureGroup,
        topic_name: &str,
    ) -> Result<()> {
        let topic_name = topic_name.to_owned();
        self.update_metadata(
            fg,
            |copy| copy.notification_topic_name = Some(topic_name),
            MetadataUpdate::Metadata,
        )
    }

    pub fn update_deprecated(&self, fg: &mut FeatureGroup, deprecate: bool) -> Result<()> {
        self.update_metadata(fg, |_| {}, MetadataUpdate::Deprecate(deprecate))
    }

    /// Commits of a time travel enabled feature group, most recent first.
    pub fn commit_details(
        &self,
        fg: &FeatureGroup,
        wallclock_time: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Commit>> {
        if fg.time_travel_format == TimeTravelFormat::None {
            return Err(Error::InvalidArgument(format!(
                "commit details are only available for time travel enabled feature groups, '{}' is not",
                fg.name
            )));
        }
        self.platform
            .commit_details(fg, wallclock_time.map(|t| t.timestamp_millis()), limit)
    }

    /// Register `fg`, taking `features` as its schema unless one was declared.
    pub fn save_feature_group_metadata(
        &self,
        fg: &mut FeatureGroup,
        features: Vec<Feature>,
    ) -> Result<()> {
        if fg.features.is_empty() {
            fg.features = features;
        } else if !features.is_empty() {
            verify_compatibility(&fg.features, &features)?;
        }
        fg.apply_key_flags()?;

        let metadata = self.platform.save(fg)?;
        fg.apply_metadata(metadata);
        log::info!(target: "featurestore",
            feature_group = fg.name.as_str(), id = fg.id, version = fg.version;
            "feature group created");
        Ok(())
    }

    fn validate_features(
        &self,
        fg: &FeatureGroup,
        batch: &RecordBatch,
        features: &[Feature],
        validation: ValidationOptions,
    ) -> Result<()> {
        validate_embedding_features(&fg.embedding_features, features)?;
        if fg.online_enabled && fg.embedding_features.is_empty() && validation.online_schema_validation
        {
            validate_online_schema(fg, batch, features)?;
        }
        Ok(())
    }

    fn run_validation(
        &self,
        fg: &FeatureGroup,
        batch: &RecordBatch,
        validation: ValidationOptions,
    ) -> Result<Option<ValidationReport>> {
        if !validation.run_validation {
            return Ok(None);
        }
        self.validation.validate(fg, batch)
    }

    /// Apply `change` to a copy of `fg` and send it. `fg` only changes once the platform accepted
    /// the update.
    fn update_metadata(
        &self,
        fg: &mut FeatureGroup,
        change: impl FnOnce(&mut FeatureGroup),
        update: MetadataUpdate,
    ) -> Result<()> {
        let mut copy = fg.clone();
        change(&mut copy);
        let metadata = self.platform.update_metadata(&copy, update)?;
        copy.apply_metadata(metadata);
        *fg = copy;
        Ok(())
    }
}

impl<P> std::fmt::Debug for FeatureGroupEngine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureGroupEngine")
            .field("external_client", &self.external_client)
            .finish_non_exhaustive()
    }
}
