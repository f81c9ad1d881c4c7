use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which parts of an inference request are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceLoggingMode {
    None,
    All,
    Predictions,
    ModelInputs,
}

impl InferenceLoggingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InferenceLoggingMode::None => "NONE",
            InferenceLoggingMode::All => "ALL",
            InferenceLoggingMode::Predictions => "PREDICTIONS",
            InferenceLoggingMode::ModelInputs => "MODEL_INPUTS",
        }
    }
}

impl fmt::Display for InferenceLoggingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InferenceLoggingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<InferenceLoggingMode> {
        match s {
            "NONE" => Ok(InferenceLoggingMode::None),
            "ALL" => Ok(InferenceLoggingMode::All),
            "PREDICTIONS" => Ok(InferenceLoggingMode::Predictions),
            "MODEL_INPUTS" => Ok(InferenceLoggingMode::ModelInputs),
            _ => Err(Error::InvalidArgument(format!(
                "inference logging mode '{s}' is not valid, possible values are NONE, ALL, PREDICTIONS, MODEL_INPUTS"
            ))),
        }
    }
}

/// Topic inference logs are sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaTopic {
    pub name: String,
    #[serde(rename = "numOfReplicas", alias = "numReplicas", default)]
    pub num_replicas: Option<u32>,
    #[serde(rename = "numOfPartitions", alias = "numPartitions", default)]
    pub num_partitions: Option<u32>,
}

impl KafkaTopic {
    /// Name asking the platform to create a new topic for the deployment.
    pub const CREATE: &'static str = "CREATE";
    /// Name disabling inference logging.
    pub const NONE: &'static str = "NONE";

    pub fn new(name: impl Into<String>) -> KafkaTopic {
        KafkaTopic {
            name: name.into(),
            num_replicas: None,
            num_partitions: None,
        }
    }

    /// A new topic with one replica and one partition.
    pub fn create() -> KafkaTopic {
        KafkaTopic {
            name: KafkaTopic::CREATE.to_owned(),
            num_replicas: Some(1),
            num_partitions: Some(1),
        }
    }
}

/// Inference logging configuration of a predictor.
///
/// Without a topic nothing is logged, whatever the requested mode.
///
/// ```
/// # use featurestore::serving::{InferenceLogger, InferenceLoggingMode, KafkaTopic};
/// let logger = InferenceLogger::new(Some(KafkaTopic::new("inference_logs")), Some("PREDICTIONS"))?;
/// assert_eq!(logger.mode, InferenceLoggingMode::Predictions);
///
/// let logger = InferenceLogger::new(None, Some("ALL"))?;
/// assert_eq!(logger.mode, InferenceLoggingMode::None);
/// # Ok::<(), featurestore::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InferenceLoggerWire", into = "InferenceLoggerWire")]
pub struct InferenceLogger {
    pub kafka_topic: Option<KafkaTopic>,
    pub mode: InferenceLoggingMode,
}

impl InferenceLogger {
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `mode` is not one of `NONE`, `ALL`, `PREDICTIONS` or
    /// `MODEL_INPUTS`.
    pub fn new(kafka_topic: Option<KafkaTopic>, mode: Option<&str>) -> Result<InferenceLogger> {
        let mode = mode.map(InferenceLoggingMode::from_str).transpose()?;
        let mode = match (&kafka_topic, mode) {
            (None, _) => InferenceLoggingMode::None,
            (Some(_), None) => InferenceLoggingMode::None,
            (Some(_), Some(mode)) => mode,
        };
        Ok(InferenceLogger { kafka_topic, mode })
    }
}

impl Default for InferenceLogger {
    /// Log everything to a newly created topic.
    fn default() -> InferenceLogger {
        InferenceLogger {
            kafka_topic: Some(KafkaTopic::create()),
            mode: InferenceLoggingMode::All,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InferenceLoggerWire {
    #[serde(rename = "kafkaTopicDTO", alias = "kafkaTopic", default, skip_serializing_if = "Option::is_none")]
    kafka_topic: Option<KafkaTopic>,
    #[serde(rename = "inferenceLogging", alias = "mode", default)]
    mode: Option<String>,
}

impl TryFrom<InferenceLoggerWire> for InferenceLogger {
    type Error = Error;

    fn try_from(value: InferenceLoggerWire) -> Result<InferenceLogger> {
        InferenceLogger::new(value.kafka_topic, value.mode.as_deref())
    }
}

impl From<InferenceLogger> for InferenceLoggerWire {
    fn from(value: InferenceLogger) -> Self {
        InferenceLoggerWire {
            kafka_topic: value.kafka_topic,
            mode: Some(value.mode.as_str().to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn mode_depends_on_topic() {
        let topic = || Some(KafkaTopic::new("logs"));

        assert_eq!(
            InferenceLogger::new(topic(), None).unwrap().mode,
            InferenceLoggingMode::None
        );
        assert_eq!(
            InferenceLogger::new(topic(), Some("MODEL_INPUTS")).unwrap().mode,
            InferenceLoggingMode::ModelInputs
        );
        assert_eq!(
            InferenceLogger::new(None, Some("ALL")).unwrap().mode,
            InferenceLoggingMode::None
        );
        assert!(matches!(
            InferenceLogger::new(topic(), Some("SOME")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn default_logs_everything_to_new_topic() {
        let logger = InferenceLogger::default();
        assert_eq!(logger.mode, InferenceLoggingMode::All);
        assert_eq!(
            serde_json::to_value(&logger).unwrap(),
            json!({
                "inferenceLogging": "ALL",
                "kafkaTopicDTO": {"name": "CREATE", "numOfReplicas": 1, "numOfPartitions": 1},
            })
        );
    }

    #[test]
    fn deserializes_platform_responses() {
        let logger: InferenceLogger = serde_json::from_value(json!({
            "kafkaTopicDTO": {"name": "fraud_inference_logs", "numOfPartitions": 3},
            "inferenceLogging": "PREDICTIONS",
        }))
        .unwrap();
        assert_eq!(logger.mode, InferenceLoggingMode::Predictions);
        let topic = logger.kafka_topic.unwrap();
        assert_eq!(topic.name, "fraud_inference_logs");
        assert_eq!(topic.num_partitions, Some(3));
        assert_eq!(topic.num_replicas, None);

        let logger: InferenceLogger =
            serde_json::from_value(json!({"inferenceLogging": "ALL"})).unwrap();
        assert_eq!(logger, InferenceLogger::new(None, None).unwrap());

        assert!(serde_json::from_value::<InferenceLogger>(json!({
            "kafkaTopic": {"name": "logs"},
            "mode": "VERBOSE",
        }))
        .is_err());
    }
}
