//! The Rust SDK for a managed feature store and model serving platform.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that writes dataframes, represented as Arrow
//! [`RecordBatch`](arrow::array::RecordBatch)es, into [`FeatureGroup`]s. A write infers the
//! dataframe's features, applies the feature group's on-demand transformation functions, checks
//! the result against the registered schema (registering the feature group on first write) and
//! hands the rows to the feature group's writer:
//!
//! - streaming feature groups publish every row to the feature group's Kafka topic and run the
//!   materialization job copying the rows to offline storage;
//! - batch feature groups upload the dataframe as Parquet and run an ingestion job.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use arrow::array::{ArrayRef, Int64Array, RecordBatch};
//! # use featurestore::{ClientConfig, WriteOptions};
//! let client = ClientConfig::from_api_key("api-key")
//!     .project_id(119)
//!     .to_client()?;
//! let mut fg = client.feature_group("transactions", Some(1))?;
//! let batch = RecordBatch::try_from_iter([
//!     ("id", Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef),
//! ])?;
//! client.insert(&mut fg, &batch, &WriteOptions::new().with_wait_for_job(true))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Multi-part inserts
//!
//! Large dataframes can be written in parts sharing one producer. Create a session with
//! [`IngestionSession::multi_part`], pass it to [`Client::insert_part`] for every part and close it
//! after the last one.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Schema errors are returned before any row is
//! published. Once publishing started, the first fatal delivery failure aborts the write; rows
//! already published are not rolled back.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, under
//! the `featurestore` target with structured key-values. Consider integrating a `log`-compatible
//! logger implementation for visibility into ingestion progress.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod feature_group_engine;
pub mod rest_client;
pub mod serving;
pub mod write_engine;

mod client;
mod config;

use featurestore_core::collaborators::{
    FeatureGroupApi, KafkaConfigResolver, MaterializationJob, OnlineIngestionApi,
};

#[doc(inline)]
pub use featurestore_core::{
    checkpoint::Checkpoint,
    collaborators::{Job, ValidationReport},
    feature_group::{FeatureGroupKind, TimeTravelFormat},
    session::IngestionSession,
    transformation::{TransformationContext, TransformationFunctionBinding},
    write_options::{BackfillInterval, OnlineIngestionWaitOptions, WriteOptions},
    Error, Feature, FeatureGroup, FeatureValue, Result,
};

pub use client::Client;
pub use config::ClientConfig;
pub use feature_group_engine::FeatureGroupEngine;

/// Every remote service a write talks to.
pub trait Platform:
    FeatureGroupApi + KafkaConfigResolver + MaterializationJob + OnlineIngestionApi
{
}

impl<T> Platform for T where
    T: FeatureGroupApi + KafkaConfigResolver + MaterializationJob + OnlineIngestionApi
{
}
