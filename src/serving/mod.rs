//! Deployment settings of model serving: per-component resources and inference logging.
mod inference_logger;
mod resources;

pub use inference_logger::{InferenceLogger, InferenceLoggingMode, KafkaTopic};
pub use resources::{
    Component, ComponentResources, PartialResources, Predictor, PredictorResources, Resources,
    Transformer, TransformerResources, GPUS, MAX_CORES, MAX_MEMORY, MIN_CORES, MIN_MEMORY,
};
