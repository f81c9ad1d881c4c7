use std::sync::Arc;

use crate::transformation::TransformationType;

/// Represents a result type for operations in the feature store SDK.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// SDK-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the feature store SDK.
///
/// Errors raised before the first row is published (schema, transformation and validation errors)
/// leave the broker untouched.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A dataframe column has a type that cannot be mapped to a feature type and no declared
    /// feature covers it.
    #[error("feature '{feature}': {reason}")]
    SchemaInference {
        /// Name of the offending feature.
        feature: String,
        /// Why inference failed.
        reason: String,
    },

    /// Dataframe features do not match the registered feature group schema.
    #[error("features are not compatible with feature group schema: {}", join_mismatches(.mismatches))]
    SchemaMismatch {
        /// One entry per unmatched feature, e.g. `age (bigint != int)`.
        mismatches: Vec<String>,
    },

    /// Input features of a transformation function are missing from the dataframe.
    #[error("{}", missing_feature_message(.features, .function_name, .transformation_type))]
    MissingFeature {
        /// Missing feature names, sorted.
        features: Vec<String>,
        /// Name of the transformation function declaring them.
        function_name: String,
        /// Whether the binding runs at insertion or at retrieval time.
        transformation_type: TransformationType,
    },

    /// The validation gate rejected the dataframe.
    #[error("data validation failed while validation ingestion policy set to strict, insertion to {feature_group} was aborted; report: {report_url}")]
    ValidationRejected {
        /// Feature group name.
        feature_group: String,
        /// Where the validation report can be inspected.
        report_url: String,
    },

    /// The broker refused to accept messages for the topic.
    #[error("not authorized to publish to topic '{0}'")]
    AuthorizationFailed(String),

    /// A message could not be delivered before the producer's delivery timeout.
    #[error("message delivery timed out: {0}")]
    DeliveryTimeout(String),

    /// The requested operation needs an execution engine this SDK does not provide.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An ingestion session was used in a state that does not allow the operation.
    #[error("ingestion session is {state}, cannot {operation}")]
    InvalidSessionState {
        /// Current session state.
        state: &'static str,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// A row could not be encoded to the wire format.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// An Arrow compute or construction error.
    #[error(transparent)]
    // ArrowError is not clonable, so we're wrapping it in an Arc.
    Arrow(Arc<arrow::error::ArrowError>),

    /// A broker client error.
    #[error(transparent)]
    Kafka(Arc<rdkafka::error::KafkaError>),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// The platform reported an error for a remote call.
    #[error("feature store error: {0}")]
    FeatureStore(String),

    /// Waiting for a remote operation exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// An argument passed by the caller is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn join_mismatches(mismatches: &[String]) -> String {
    mismatches.join(", ")
}

fn missing_feature_message(
    features: &[String],
    function_name: &str,
    transformation_type: &TransformationType,
) -> String {
    let features = features.join("`, `");
    match transformation_type {
        TransformationType::OnDemand => format!(
            "the following feature(s): `{features}`, specified in the on-demand transformation function '{function_name}' are not present in the dataframe being inserted into the feature group. Please verify that the correct feature names are used in the transformation function and that these features exist in the dataframe being inserted."
        ),
        TransformationType::ModelDependent => format!(
            "the following feature(s): `{features}`, specified in the model-dependent transformation function '{function_name}' are not present in the feature view. Please verify that the correct features are specified in the transformation function."
        ),
    }
}

impl Error {
    /// Return `true` if the error was raised by the broker while publishing and aborts the batch.
    pub fn is_delivery_fatal(&self) -> bool {
        matches!(
            self,
            Error::AuthorizationFailed(_) | Error::DeliveryTimeout(_)
        )
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(value: arrow::error::ArrowError) -> Self {
        Error::Arrow(Arc::new(value))
    }
}

impl From<rdkafka::error::KafkaError> for Error {
    fn from(value: rdkafka::error::KafkaError) -> Self {
        Error::Kafka(Arc::new(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
