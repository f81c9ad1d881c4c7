//! [`Broker`] backed by librdkafka.
use std::time::Duration;

use rdkafka::{
    consumer::{BaseConsumer, Consumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::{Header, Message, OwnedHeaders},
    producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext},
    util::Timeout,
    ClientConfig, ClientContext,
};

use super::{
    Broker, BrokerConfig, DeliveryFailure, DeliveryTracker, MessageProducer, OutgoingMessage,
    ProduceError, WatermarkSource,
};
use crate::{Error, Result};

/// Consumer group used for metadata requests unless the connector configures one.
pub const DEFAULT_CONSUMER_GROUP: &str = "featurestore_consumer_group";

fn client_config(config: &BrokerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    for (key, value) in &config.properties {
        client_config.set(key, value);
    }
    client_config
}

/// Feeds librdkafka delivery reports into a [`DeliveryTracker`].
pub struct TrackingContext {
    tracker: DeliveryTracker,
}

impl ClientContext for TrackingContext {}

impl ProducerContext for TrackingContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        match result {
            Ok(_) => self.tracker.record_delivered(),
            Err((err, message)) => self
                .tracker
                .record_failure(classify(err, message.topic())),
        }
    }
}

fn classify(err: &KafkaError, topic: &str) -> DeliveryFailure {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::TopicAuthorizationFailed) => DeliveryFailure::AuthorizationFailed {
            topic: topic.to_owned(),
        },
        Some(RDKafkaErrorCode::MessageTimedOut) => DeliveryFailure::TimedOut {
            topic: topic.to_owned(),
            reason: err.to_string(),
        },
        _ => DeliveryFailure::Other {
            topic: topic.to_owned(),
            reason: err.to_string(),
        },
    }
}

pub struct KafkaProducer {
    producer: BaseProducer<TrackingContext>,
}

impl KafkaProducer {
    pub fn new(config: &BrokerConfig, tracker: DeliveryTracker) -> Result<KafkaProducer> {
        let producer = client_config(config).create_with_context(TrackingContext { tracker })?;
        Ok(KafkaProducer { producer })
    }
}

impl MessageProducer for KafkaProducer {
    fn send(&mut self, message: OutgoingMessage<'_>) -> std::result::Result<(), ProduceError> {
        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(message.headers.len()), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            });
        let record = BaseRecord::to(message.topic)
            .key(message.key)
            .payload(message.payload)
            .headers(headers);

        match self.producer.send(record) {
            Ok(()) => Ok(()),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                Err(ProduceError::QueueFull)
            }
            Err((err, _)) => Err(ProduceError::Failed(err.into())),
        }
    }

    fn poll(&mut self, timeout: Duration) {
        self.producer.poll(timeout);
    }

    fn flush(&mut self) -> Result<()> {
        self.producer.flush(Timeout::Never)?;
        Ok(())
    }
}

pub struct KafkaWatermarks {
    consumer: BaseConsumer,
    timeout: Duration,
}

impl KafkaWatermarks {
    pub fn new(config: &BrokerConfig) -> Result<KafkaWatermarks> {
        let mut client_config = client_config(config);
        if !config.properties.contains_key("group.id") {
            client_config.set("group.id", DEFAULT_CONSUMER_GROUP);
        }
        Ok(KafkaWatermarks {
            consumer: client_config.create()?,
            timeout: config.timeout,
        })
    }
}

impl WatermarkSource for KafkaWatermarks {
    fn partitions(&self, topic: &str) -> Result<Option<Vec<i32>>> {
        let metadata = self.consumer.fetch_metadata(None, self.timeout)?;
        Ok(metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none())
            .map(|t| t.partitions().iter().map(|p| p.id()).collect()))
    }

    fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        self.consumer
            .fetch_watermarks(topic, partition, self.timeout)
            .map_err(Error::from)
    }
}

/// Creates rdkafka producers and consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaBroker;

impl Broker for KafkaBroker {
    fn producer(
        &self,
        config: &BrokerConfig,
        tracker: DeliveryTracker,
    ) -> Result<Box<dyn MessageProducer>> {
        Ok(Box::new(KafkaProducer::new(config, tracker)?))
    }

    fn watermark_source(&self, config: &BrokerConfig) -> Result<Box<dyn WatermarkSource>> {
        Ok(Box::new(KafkaWatermarks::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_delivery_errors() {
        let auth = KafkaError::MessageProduction(RDKafkaErrorCode::TopicAuthorizationFailed);
        let timeout = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        let other = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);

        assert_eq!(
            classify(&auth, "t"),
            DeliveryFailure::AuthorizationFailed {
                topic: "t".to_owned()
            }
        );
        assert!(classify(&timeout, "t").is_fatal());
        assert!(!classify(&other, "t").is_fatal());
    }

    #[test]
    fn connector_group_id_is_kept() {
        let mut config = BrokerConfig::default();
        config
            .properties
            .insert("bootstrap.servers".to_owned(), "localhost:9092".to_owned());
        config
            .properties
            .insert("group.id".to_owned(), "custom".to_owned());

        assert_eq!(client_config(&config).get("group.id"), Some("custom"));
    }
}
