//! Options controlling how a dataframe is written and what happens after delivery.
use std::{collections::BTreeMap, time::Duration};

/// How often the materialization job re-runs after the first ingestion into a new topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillInterval {
    /// A quartz cron expression, used as is.
    Cron(String),
    /// Every `n` hours, starting from the time of the ingestion.
    Hours(u32),
}

impl From<u32> for BackfillInterval {
    fn from(value: u32) -> Self {
        BackfillInterval::Hours(value)
    }
}

impl From<&str> for BackfillInterval {
    fn from(value: &str) -> Self {
        BackfillInterval::Cron(value.to_owned())
    }
}

/// Configuration for waiting on an online ingestion.
#[derive(Debug, Clone)]
pub struct OnlineIngestionWaitOptions {
    /// Give up waiting after this long.
    ///
    /// Defaults to [`OnlineIngestionWaitOptions::DEFAULT_TIMEOUT`].
    pub timeout: Duration,
    /// Interval between status requests.
    ///
    /// Defaults to [`OnlineIngestionWaitOptions::DEFAULT_PERIOD`].
    pub period: Duration,
    /// Random extra delay added to each interval.
    ///
    /// Defaults to [`OnlineIngestionWaitOptions::DEFAULT_JITTER`].
    pub jitter: Duration,
}

impl OnlineIngestionWaitOptions {
    /// Default value for [`OnlineIngestionWaitOptions::timeout`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
    /// Default value for [`OnlineIngestionWaitOptions::period`].
    pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);
    /// Default value for [`OnlineIngestionWaitOptions::jitter`].
    pub const DEFAULT_JITTER: Duration = Duration::from_millis(200);

    pub fn new() -> OnlineIngestionWaitOptions {
        OnlineIngestionWaitOptions::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> OnlineIngestionWaitOptions {
        self.timeout = timeout;
        self
    }

    pub fn with_period(mut self, period: Duration) -> OnlineIngestionWaitOptions {
        self.period = period;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> OnlineIngestionWaitOptions {
        self.jitter = jitter;
        self
    }
}

impl Default for OnlineIngestionWaitOptions {
    fn default() -> OnlineIngestionWaitOptions {
        OnlineIngestionWaitOptions {
            timeout: OnlineIngestionWaitOptions::DEFAULT_TIMEOUT,
            period: OnlineIngestionWaitOptions::DEFAULT_PERIOD,
            jitter: OnlineIngestionWaitOptions::DEFAULT_JITTER,
        }
    }
}

/// Options for writing a dataframe into a feature group.
///
/// ```
/// # use featurestore_core::write_options::WriteOptions;
/// let options = WriteOptions::new()
///     .with_wait_for_job(true)
///     .with_offline_backfill_every_hr(6u32);
/// assert!(options.start_offline_materialization());
/// ```
#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub(crate) start_offline_materialization: Option<bool>,
    pub(crate) start_offline_backfill: Option<bool>,
    pub(crate) wait_for_job: Option<bool>,
    /// Block until the online ingestion of the written rows completed. Only applies to
    /// online-enabled feature groups.
    pub wait_for_online_ingestion: bool,
    pub online_ingestion_options: OnlineIngestionWaitOptions,
    /// Run the materialization job without a resume checkpoint.
    pub skip_offsets: bool,
    /// Register a recurring materialization schedule after the first ingestion into a new topic.
    pub offline_backfill_every_hr: Option<BackfillInterval>,
    /// Properties overriding the broker connection settings of the feature store.
    pub kafka_producer_config: BTreeMap<String, String>,
    /// Use the broker listeners internal to the platform even when running outside of it.
    pub internal_kafka: bool,
    /// Timeout for broker metadata requests.
    ///
    /// Defaults to [`WriteOptions::DEFAULT_KAFKA_TIMEOUT`].
    pub kafka_timeout: Duration,
    /// Log every failed delivery and buffer-full retry.
    pub debug_kafka: bool,
    /// Passed to the platform when configuring a batch ingestion job.
    pub job_write_options: BTreeMap<String, String>,
}

impl WriteOptions {
    /// Default value for [`WriteOptions::kafka_timeout`].
    pub const DEFAULT_KAFKA_TIMEOUT: Duration = Duration::from_secs(6);

    pub fn new() -> WriteOptions {
        WriteOptions::default()
    }

    /// Whether the materialization job runs after rows are published to an existing topic.
    ///
    /// Defaults to `true`. `start_offline_backfill` is honored if set and
    /// `start_offline_materialization` is not.
    pub fn start_offline_materialization(&self) -> bool {
        self.start_offline_materialization
            .or(self.start_offline_backfill)
            .unwrap_or(true)
    }

    pub fn with_start_offline_materialization(mut self, start: bool) -> WriteOptions {
        self.start_offline_materialization = Some(start);
        self
    }

    /// Legacy name of [`WriteOptions::with_start_offline_materialization`].
    pub fn with_start_offline_backfill(mut self, start: bool) -> WriteOptions {
        self.start_offline_backfill = Some(start);
        self
    }

    /// Whether to block until the triggered job finished, `default` if not set.
    ///
    /// Streaming writes do not wait by default, batch uploads do.
    pub fn wait_for_job(&self, default: bool) -> bool {
        self.wait_for_job.unwrap_or(default)
    }

    pub fn with_wait_for_job(mut self, wait: bool) -> WriteOptions {
        self.wait_for_job = Some(wait);
        self
    }

    pub fn with_wait_for_online_ingestion(mut self, wait: bool) -> WriteOptions {
        self.wait_for_online_ingestion = wait;
        self
    }

    pub fn with_online_ingestion_options(
        mut self,
        options: OnlineIngestionWaitOptions,
    ) -> WriteOptions {
        self.online_ingestion_options = options;
        self
    }

    pub fn with_skip_offsets(mut self, skip: bool) -> WriteOptions {
        self.skip_offsets = skip;
        self
    }

    pub fn with_offline_backfill_every_hr(
        mut self,
        interval: impl Into<BackfillInterval>,
    ) -> WriteOptions {
        self.offline_backfill_every_hr = Some(interval.into());
        self
    }

    /// Override a broker client property, e.g. `linger.ms`.
    pub fn with_kafka_producer_config(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> WriteOptions {
        self.kafka_producer_config.insert(key.into(), value.into());
        self
    }

    pub fn with_internal_kafka(mut self, internal: bool) -> WriteOptions {
        self.internal_kafka = internal;
        self
    }

    pub fn with_kafka_timeout(mut self, timeout: Duration) -> WriteOptions {
        self.kafka_timeout = timeout;
        self
    }

    pub fn with_debug_kafka(mut self, debug: bool) -> WriteOptions {
        self.debug_kafka = debug;
        self
    }

    pub fn with_job_write_option(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> WriteOptions {
        self.job_write_options.insert(key.into(), value.into());
        self
    }
}

impl Default for WriteOptions {
    fn default() -> WriteOptions {
        WriteOptions {
            start_offline_materialization: None,
            start_offline_backfill: None,
            wait_for_job: None,
            wait_for_online_ingestion: false,
            online_ingestion_options: OnlineIngestionWaitOptions::default(),
            skip_offsets: false,
            offline_backfill_every_hr: None,
            kafka_producer_config: BTreeMap::new(),
            internal_kafka: false,
            kafka_timeout: WriteOptions::DEFAULT_KAFKA_TIMEOUT,
            debug_kafka: false,
            job_write_options: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialization_defaults_to_true() {
        assert!(WriteOptions::new().start_offline_materialization());
    }

    #[test]
    fn legacy_backfill_flag_is_honored() {
        let options = WriteOptions::new().with_start_offline_backfill(false);
        assert!(!options.start_offline_materialization());

        let options = options.with_start_offline_materialization(true);
        assert!(options.start_offline_materialization());
    }

    #[test]
    fn job_wait_default_depends_on_caller() {
        assert!(WriteOptions::new().wait_for_job(true));
        assert!(!WriteOptions::new().wait_for_job(false));
        assert!(!WriteOptions::new().with_wait_for_job(false).wait_for_job(true));
    }
}
