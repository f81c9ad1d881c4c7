//! Delivery of encoded rows to the broker.
//!
//! Publishing is single-threaded: acknowledgments are processed by [`MessageProducer::poll`] on
//! the caller's thread and recorded in a [`DeliveryTracker`]. A full producer queue is not an error,
//! [`publish`] waits and retries the same row until it is accepted.
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crate::{
    checkpoint::Checkpoint,
    collaborators::{KafkaConfigResolver, OnlineIngestionApi},
    feature_group::FeatureGroup,
    write_options::WriteOptions,
    Error, Result,
};

pub mod kafka;

/// How long to wait for acknowledgments before retrying a row the producer queue rejected.
pub const QUEUE_FULL_BACKOFF: Duration = Duration::from_secs(1);

/// Reasons the producer did not accept a message.
#[derive(Debug, Clone)]
pub enum ProduceError {
    /// The local producer queue is full. The message was not sent and can be retried.
    QueueFull,
    Failed(Error),
}

/// A message ready to be published.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingMessage<'a> {
    pub topic: &'a str,
    pub key: &'a str,
    pub payload: &'a [u8],
    pub headers: &'a [(String, String)],
}

/// The producing half of a broker client.
pub trait MessageProducer {
    /// Enqueue `message` for delivery. Delivery reports are processed by [`MessageProducer::poll`].
    fn send(&mut self, message: OutgoingMessage<'_>) -> std::result::Result<(), ProduceError>;

    /// Serve delivery reports, waiting at most `timeout` for one.
    fn poll(&mut self, timeout: Duration);

    /// Block until every enqueued message was acknowledged or failed.
    fn flush(&mut self) -> Result<()>;
}

/// A failed delivery reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Not allowed to write to the topic.
    AuthorizationFailed { topic: String },
    /// The message was not acknowledged within the producer's delivery timeout.
    TimedOut { topic: String, reason: String },
    Other { topic: String, reason: String },
}

impl DeliveryFailure {
    /// Return `true` if the failure aborts the batch.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DeliveryFailure::Other { .. })
    }
}

impl From<DeliveryFailure> for Error {
    fn from(value: DeliveryFailure) -> Self {
        match value {
            DeliveryFailure::AuthorizationFailed { topic } => Error::AuthorizationFailed(topic),
            DeliveryFailure::TimedOut { topic, reason } => {
                Error::DeliveryTimeout(format!("{topic}: {reason}"))
            }
            DeliveryFailure::Other { topic, reason } => {
                Error::FeatureStore(format!("failed to deliver message to {topic}: {reason}"))
            }
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    delivered: u64,
    failed: u64,
    fatal: Option<DeliveryFailure>,
}

/// Counts delivery acknowledgments and remembers the first fatal failure.
///
/// Cloning is cheap and clones share their counts, so one clone can live in the producer's
/// callback while another is inspected by the publishing loop.
#[derive(Debug, Clone, Default)]
pub struct DeliveryTracker {
    state: Arc<Mutex<TrackerState>>,
    debug: bool,
}

impl DeliveryTracker {
    pub fn new() -> DeliveryTracker {
        DeliveryTracker::default()
    }

    /// Log every failed delivery, not only the first one.
    pub fn with_debug(mut self, debug: bool) -> DeliveryTracker {
        self.debug = debug;
        self
    }

    pub fn record_delivered(&self) {
        self.lock().delivered += 1;
    }

    pub fn record_failure(&self, failure: DeliveryFailure) {
        let mut state = self.lock();
        state.failed += 1;
        if self.debug || state.failed == 1 {
            log::warn!(target: "featurestore", failed = state.failed; "failed to deliver message: {failure:?}");
        }
        if failure.is_fatal() && state.fatal.is_none() {
            state.fatal = Some(failure);
        }
    }

    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    pub fn failed(&self) -> u64 {
        self.lock().failed
    }

    /// Return the first fatal failure recorded so far as an error.
    pub fn check(&self) -> Result<()> {
        match &self.lock().fatal {
            Some(failure) => Err(failure.clone().into()),
            None => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Publish one message, retrying while the producer queue is full.
///
/// Returns the number of send attempts.
///
/// # Errors
///
/// - [`Error::AuthorizationFailed`] or [`Error::DeliveryTimeout`] if the tracker recorded a fatal
///   delivery failure, for this or an earlier message.
/// - Any error the producer returns other than a full queue.
pub fn publish(
    producer: &mut dyn MessageProducer,
    tracker: &DeliveryTracker,
    message: OutgoingMessage<'_>,
) -> Result<usize> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match producer.send(message) {
            Ok(()) => {
                producer.poll(Duration::ZERO);
                tracker.check()?;
                return Ok(attempts);
            }
            Err(ProduceError::QueueFull) => {
                if tracker.debug {
                    log::debug!(target: "featurestore", topic = message.topic, attempts; "producer queue full, waiting");
                }
                producer.poll(QUEUE_FULL_BACKOFF);
                tracker.check()?;
            }
            Err(ProduceError::Failed(err)) => return Err(err),
        }
    }
}

/// Read-only topic metadata.
pub trait WatermarkSource {
    /// Partition ids of `topic`, `None` if the topic does not exist.
    fn partitions(&self, topic: &str) -> Result<Option<Vec<i32>>>;

    /// Low and high watermark of one partition.
    fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64)>;
}

/// Current offsets of every partition of `topic`: the high watermarks if `high`, the low ones
/// otherwise. `None` if the topic does not exist.
pub fn watermarks(source: &dyn WatermarkSource, topic: &str, high: bool) -> Result<Option<Checkpoint>> {
    let Some(partitions) = source.partitions(topic)? else {
        log::debug!(target: "featurestore", topic; "topic does not exist yet");
        return Ok(None);
    };

    let mut checkpoint = Checkpoint::new(topic);
    for partition in partitions {
        let (low, high_watermark) = source.watermarks(topic, partition)?;
        checkpoint
            .offsets
            .insert(partition, if high { high_watermark } else { low });
    }
    Ok(Some(checkpoint))
}

/// Broker client properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerConfig {
    pub properties: BTreeMap<String, String>,
    /// Timeout for metadata requests.
    pub timeout: Duration,
    pub debug: bool,
}

impl BrokerConfig {
    /// Resolve the connection properties of the feature store's broker and apply the overrides of
    /// `options`.
    ///
    /// `external_client` tells whether the SDK runs outside of the platform. Internal listeners
    /// are used otherwise, or if [`WriteOptions::internal_kafka`] is set.
    pub fn resolve(
        resolver: &dyn KafkaConfigResolver,
        feature_store_id: i64,
        external_client: bool,
        options: &WriteOptions,
    ) -> Result<BrokerConfig> {
        let external = external_client && !options.internal_kafka;
        let mut properties = resolver.kafka_config(feature_store_id, external)?;
        properties.extend(
            options
                .kafka_producer_config
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Ok(BrokerConfig {
            properties,
            timeout: options.kafka_timeout,
            debug: options.debug_kafka,
        })
    }
}

/// Creates broker clients.
pub trait Broker: Send + Sync {
    /// A producer whose delivery reports are recorded in `tracker`.
    fn producer(
        &self,
        config: &BrokerConfig,
        tracker: DeliveryTracker,
    ) -> Result<Box<dyn MessageProducer>>;

    fn watermark_source(&self, config: &BrokerConfig) -> Result<Box<dyn WatermarkSource>>;
}

/// Headers attached to every message of an ingestion.
///
/// For online-enabled feature groups an online ingestion expecting `num_entries` rows is created
/// and its id added to the headers.
pub fn message_headers(
    fg: &FeatureGroup,
    online_ingestions: &dyn OnlineIngestionApi,
    num_entries: Option<i64>,
) -> Result<Vec<(String, String)>> {
    let id = fg.id.ok_or_else(|| {
        Error::InvalidArgument(format!("feature group '{}' is not registered", fg.name))
    })?;

    let mut headers = vec![
        ("projectId".to_owned(), fg.project_id.to_string()),
        ("featureGroupId".to_owned(), id.to_string()),
        (
            "subjectId".to_owned(),
            fg.subject_id.map(|s| s.to_string()).unwrap_or_default(),
        ),
    ];

    if fg.online_enabled {
        let ingestion = online_ingestions.create(fg, num_entries)?;
        headers.push(("onlineIngestionId".to_owned(), ingestion.id.to_string()));
    }
    Ok(headers)
}
