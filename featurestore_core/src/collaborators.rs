//! Interfaces to the platform services the ingestion pipeline depends on, and the records they
//! exchange.
//!
//! The SDK implements these traits over the platform's REST API. Tests implement them in memory.
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use arrow::array::RecordBatch;
use chrono::{DateTime, Utc};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    feature::Feature, feature_group::FeatureGroup, write_options::OnlineIngestionWaitOptions,
    Error, Result,
};

/// A job registered on the platform, e.g. the materialization job of a feature group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub name: String,
    #[serde(default)]
    pub config: JobConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_args: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Job {
        Job {
            name: name.into(),
            config: JobConfiguration::default(),
        }
    }

    /// Arguments the job is configured to run with, empty if none.
    pub fn default_args(&self) -> &str {
        self.config.default_args.as_deref().unwrap_or("")
    }
}

/// One run of a [`Job`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub args: Option<String>,
    #[serde(default)]
    pub submission_time: Option<DateTime<Utc>>,
}

/// A commit on a time-travel enabled feature group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    #[serde(rename = "commitID")]
    pub commit_id: i64,
    #[serde(default)]
    pub commit_date_string: Option<String>,
    #[serde(default)]
    pub rows_inserted: i64,
    #[serde(default)]
    pub rows_updated: i64,
    #[serde(default)]
    pub rows_deleted: i64,
}

/// Feature group metadata as stored by the platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGroupMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub online_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online_topic_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_topic_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<i64>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialization_job: Option<Job>,
}

impl From<&FeatureGroup> for FeatureGroupMetadata {
    fn from(fg: &FeatureGroup) -> Self {
        FeatureGroupMetadata {
            id: fg.id,
            name: fg.name.clone(),
            version: fg.version,
            description: fg.description.clone(),
            features: fg.features.clone(),
            online_enabled: fg.online_enabled,
            event_time: fg.event_time.clone(),
            online_topic_name: fg.online_topic_name.clone(),
            notification_topic_name: fg.notification_topic_name.clone(),
            subject_id: fg.subject_id,
            deprecated: false,
            materialization_job: fg.materialization_job.clone(),
        }
    }
}

impl FeatureGroup {
    /// Take over the fields the platform assigns or normalizes.
    pub fn apply_metadata(&mut self, metadata: FeatureGroupMetadata) {
        self.id = metadata.id.or(self.id);
        self.version = metadata.version.or(self.version);
        self.description = metadata.description;
        if !metadata.features.is_empty() {
            self.features = metadata.features;
        }
        self.online_topic_name = metadata.online_topic_name.or(self.online_topic_name.take());
        self.notification_topic_name = metadata.notification_topic_name;
        self.subject_id = metadata.subject_id.or(self.subject_id);
        self.materialization_job = metadata
            .materialization_job
            .or(self.materialization_job.take());
    }
}

/// Kind of metadata update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataUpdate {
    /// Features, description and notification topic.
    Metadata,
    /// Flag the feature group as deprecated, or lift the flag.
    Deprecate(bool),
}

/// Where the platform expects uploaded data and the job that ingests it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionJob {
    pub data_path: String,
    pub job: Job,
}

/// Feature group catalog operations.
pub trait FeatureGroupApi: Send + Sync {
    /// Register a new feature group and return its metadata, including the assigned id.
    fn save(&self, fg: &FeatureGroup) -> Result<FeatureGroupMetadata>;

    fn update_metadata(
        &self,
        fg: &FeatureGroup,
        update: MetadataUpdate,
    ) -> Result<FeatureGroupMetadata>;

    /// Remove all data from a feature group, keeping its metadata.
    fn delete_content(&self, fg: &FeatureGroup) -> Result<()>;

    /// Commits up to `wallclock_time` (epoch milliseconds), most recent first.
    fn commit_details(
        &self,
        fg: &FeatureGroup,
        wallclock_time: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Commit>>;

    /// Configure an ingestion job for a batch upload.
    fn ingestion_job(
        &self,
        fg: &FeatureGroup,
        write_options: &BTreeMap<String, String>,
    ) -> Result<IngestionJob>;

    /// Upload a file to the project's dataset storage.
    fn upload(&self, content: Vec<u8>, remote_path: &str) -> Result<()>;
}

/// Resolves broker connection properties for a feature store.
pub trait KafkaConfigResolver: Send + Sync {
    /// Client properties (`bootstrap.servers`, security settings, ...). `external` selects the
    /// listeners reachable from outside the platform's cluster.
    fn kafka_config(&self, feature_store_id: i64, external: bool)
        -> Result<BTreeMap<String, String>>;
}

/// Runs and schedules jobs.
pub trait MaterializationJob: Send + Sync {
    fn run(&self, job: &Job, args: &str, await_termination: bool) -> Result<Execution>;

    /// Run `job` periodically per the quartz `cron_expression`, starting at `start_time`.
    fn schedule(&self, job: &Job, cron_expression: &str, start_time: DateTime<Utc>)
        -> Result<()>;

    /// The most recent execution, `None` if the job never ran.
    fn last_execution(&self, job: &Job) -> Result<Option<Execution>>;

    fn default_args<'a>(&self, job: &'a Job) -> &'a str {
        job.default_args()
    }
}

/// Tracks rows written through the online ingestion pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineIngestion {
    #[serde(default)]
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_entries: Option<i64>,
    #[serde(default)]
    pub results: Vec<OnlineIngestionResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineIngestionResult {
    pub status: String,
    pub rows: i64,
}

impl OnlineIngestion {
    /// Rows the pipeline has processed so far, whether or not they were written successfully.
    pub fn processed_entries(&self) -> i64 {
        self.results.iter().map(|r| r.rows).sum()
    }

    /// Return `true` once every expected entry has been processed.
    pub fn is_complete(&self) -> bool {
        self.num_entries
            .is_some_and(|expected| self.processed_entries() >= expected)
    }
}

pub trait OnlineIngestionApi: Send + Sync {
    fn create(&self, fg: &FeatureGroup, num_entries: Option<i64>) -> Result<OnlineIngestion>;

    /// The most recently created online ingestion of `fg`.
    fn latest(&self, fg: &FeatureGroup) -> Result<Option<OnlineIngestion>>;

    fn get(&self, fg: &FeatureGroup, id: i64) -> Result<OnlineIngestion>;
}

/// Poll `ingestion` until all its entries are processed.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if the ingestion is not complete within
/// [`OnlineIngestionWaitOptions::timeout`].
pub fn wait_for_completion(
    api: &dyn OnlineIngestionApi,
    fg: &FeatureGroup,
    ingestion: OnlineIngestion,
    options: &OnlineIngestionWaitOptions,
) -> Result<OnlineIngestion> {
    let started = Instant::now();
    let mut ingestion = ingestion;
    loop {
        if ingestion.is_complete() {
            log::debug!(target: "featurestore",
                feature_group = fg.name.as_str(), rows = ingestion.processed_entries();
                "online ingestion completed");
            return Ok(ingestion);
        }
        if started.elapsed() >= options.timeout {
            log::warn!(target: "featurestore",
                feature_group = fg.name.as_str(), online_ingestion = ingestion.id;
                "timed out waiting for online ingestion");
            return Err(Error::Timeout(format!(
                "online ingestion {} of feature group '{}'",
                ingestion.id, fg.name
            )));
        }

        let jitter = thread_rng().gen_range(Duration::ZERO..=options.jitter);
        std::thread::sleep(options.period + jitter);
        ingestion = api.get(fg, ingestion.id)?;
    }
}

/// Outcome of data validation as decided by the feature group's validation ingestion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationIngestionResult {
    Ingested,
    Rejected,
    Experiment,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub success: bool,
    pub ingestion_result: ValidationIngestionResult,
    /// Where the report can be inspected.
    #[serde(default)]
    pub url: String,
}

impl ValidationReport {
    pub fn is_rejected(&self) -> bool {
        self.ingestion_result == ValidationIngestionResult::Rejected
    }
}

/// Validates a dataframe before it is written.
pub trait ValidationGate: Send + Sync {
    /// Returns `None` when the feature group has no expectations attached or validation is
    /// disabled.
    fn validate(&self, fg: &FeatureGroup, batch: &RecordBatch) -> Result<Option<ValidationReport>>;
}

/// A gate that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoValidation;

impl ValidationGate for NoValidation {
    fn validate(&self, _fg: &FeatureGroup, _batch: &RecordBatch) -> Result<Option<ValidationReport>> {
        Ok(None)
    }
}
