//! Broker resources of one ingestion, possibly spanning several dataframes.
use arrow::array::RecordBatch;

use crate::{
    collaborators::OnlineIngestionApi,
    delivery::{
        message_headers, publish, Broker, BrokerConfig, DeliveryTracker, MessageProducer,
        OutgoingMessage,
    },
    encoder::{build_encoders, encode_row, row_key, ComplexFeatureEncoders, RowEncoder},
    feature_group::FeatureGroup,
    Error, Result,
};

/// Lifecycle of an [`IngestionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// Producer, headers and encoders are ready.
    ResourcesReady,
    Publishing,
    /// Every published row was acknowledged or failed.
    Flushed,
    Closed,
}

impl SessionState {
    fn as_str(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::ResourcesReady => "ready",
            SessionState::Publishing => "publishing",
            SessionState::Flushed => "flushed",
            SessionState::Closed => "closed",
        }
    }
}

struct Resources {
    producer: Box<dyn MessageProducer>,
    headers: Vec<(String, String)>,
    complex: ComplexFeatureEncoders,
    row_encoder: RowEncoder,
    topic: String,
    primary_key: Vec<String>,
}

/// Producer, message headers and encoders used to publish the rows of a feature group.
///
/// A single-part session publishes one dataframe and is flushed right after. A multi-part session
/// is kept open by the caller across several inserts of chunks of the same data, and flushed once
/// with [`IngestionSession::close`].
///
/// ```text
/// Uninitialized -> ResourcesReady -> Publishing* -> Flushed -> Closed
/// ```
pub struct IngestionSession {
    state: SessionState,
    multi_part: bool,
    tracker: DeliveryTracker,
    resources: Option<Resources>,
    published: u64,
}

impl IngestionSession {
    pub fn new() -> IngestionSession {
        IngestionSession::with_multi_part(false)
    }

    /// A session reused by every part of a chunked insert.
    pub fn multi_part() -> IngestionSession {
        IngestionSession::with_multi_part(true)
    }

    fn with_multi_part(multi_part: bool) -> IngestionSession {
        IngestionSession {
            state: SessionState::Uninitialized,
            multi_part,
            tracker: DeliveryTracker::new(),
            resources: None,
            published: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_multi_part(&self) -> bool {
        self.multi_part
    }

    /// Rows handed to the producer so far.
    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    /// Create the producer, headers and encoders for `fg`.
    ///
    /// `num_entries` is the number of rows the online ingestion record expects. An open multi-part
    /// session keeps its resources and ignores the call.
    pub fn open(
        &mut self,
        fg: &FeatureGroup,
        broker: &dyn Broker,
        config: &BrokerConfig,
        online_ingestions: &dyn OnlineIngestionApi,
        num_entries: Option<i64>,
    ) -> Result<()> {
        match self.state {
            SessionState::Uninitialized => {}
            SessionState::ResourcesReady | SessionState::Publishing if self.multi_part => {
                log::debug!(target: "featurestore",
                    feature_group = fg.name.as_str();
                    "reusing multi-part ingestion session");
                return Ok(());
            }
            state => return Err(invalid(state, "open")),
        }

        let topic = fg.online_topic()?.to_owned();
        let headers = message_headers(fg, online_ingestions, num_entries)?;
        let (complex, row_encoder) = build_encoders(fg)?;
        self.tracker = DeliveryTracker::new().with_debug(config.debug);
        let producer = broker.producer(config, self.tracker.clone())?;

        log::debug!(target: "featurestore",
            feature_group = fg.name.as_str(), topic = topic.as_str(), multi_part = self.multi_part;
            "opened ingestion session");

        self.resources = Some(Resources {
            producer,
            headers,
            complex,
            row_encoder,
            topic,
            primary_key: fg.primary_key.clone(),
        });
        self.state = SessionState::ResourcesReady;
        Ok(())
    }

    /// Encode and publish every row of `batch`. Returns the number of rows published.
    ///
    /// # Errors
    ///
    /// - [`Error::Encoding`] if a row cannot be encoded or has an empty key although primary keys
    ///   are declared.
    /// - The first fatal delivery failure, see [`publish`].
    pub fn publish_batch(&mut self, batch: &RecordBatch) -> Result<usize> {
        let state = self.state;
        let resources = match (&mut self.resources, state) {
            (Some(resources), SessionState::ResourcesReady | SessionState::Publishing) => resources,
            _ => return Err(invalid(state, "publish")),
        };
        self.state = SessionState::Publishing;

        for row in 0..batch.num_rows() {
            let payload = encode_row(
                &resources.complex,
                &resources.row_encoder,
                &batch.slice(row, 1),
            )?;
            let key = row_key(batch, row, &resources.primary_key)?;
            if key.is_empty() && !resources.primary_key.is_empty() {
                return Err(Error::Encoding(format!(
                    "row {row} has no value for primary key {:?}",
                    resources.primary_key
                )));
            }

            publish(
                resources.producer.as_mut(),
                &self.tracker,
                OutgoingMessage {
                    topic: &resources.topic,
                    key: &key,
                    payload: &payload,
                    headers: &resources.headers,
                },
            )?;
            self.published += 1;
        }

        log::debug!(target: "featurestore",
            topic = resources.topic.as_str(), rows = batch.num_rows(), published = self.published;
            "published dataframe");
        Ok(batch.num_rows())
    }

    /// Block until every published row was acknowledged or failed.
    pub fn flush(&mut self) -> Result<()> {
        let state = self.state;
        let resources = match (&mut self.resources, state) {
            (Some(resources), SessionState::ResourcesReady | SessionState::Publishing) => resources,
            _ => return Err(invalid(state, "flush")),
        };

        resources.producer.flush()?;
        self.state = SessionState::Flushed;

        log::info!(target: "featurestore",
            topic = resources.topic.as_str(),
            published = self.published,
            delivered = self.tracker.delivered(),
            failed = self.tracker.failed();
            "finished publishing rows");
        self.tracker.check()
    }

    /// Flush if rows are still in flight, then release the producer.
    pub fn close(&mut self) -> Result<()> {
        let flushed = match self.state {
            SessionState::ResourcesReady | SessionState::Publishing => self.flush(),
            _ => Ok(()),
        };
        self.resources = None;
        self.state = SessionState::Closed;
        flushed
    }
}

fn invalid(state: SessionState, operation: &'static str) -> Error {
    Error::InvalidSessionState {
        state: state.as_str(),
        operation,
    }
}

impl Default for IngestionSession {
    fn default() -> IngestionSession {
        IngestionSession::new()
    }
}

impl std::fmt::Debug for IngestionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionSession")
            .field("state", &self.state)
            .field("multi_part", &self.multi_part)
            .field("published", &self.published)
            .finish_non_exhaustive()
    }
}
