//! `featurestore_core` is a library of building blocks for feature store SDKs. If you want to write
//! data to a feature store, you probably want the `featurestore` crate instead.
//!
//! # Overview
//!
//! Dataframes are Arrow [`RecordBatch`](arrow::array::RecordBatch)es. Writing one to a
//! [`FeatureGroup`] goes through the following steps, each provided by a module of this crate:
//!
//! [`schema`] infers [`Feature`]s from the dataframe and checks them against the schema already
//! registered for the feature group. It also sanitizes column names and validates keys of
//! online-enabled feature groups.
//!
//! [`transformation`] applies on-demand transformation functions to the dataframe. Their output
//! columns are appended after the original features and replace columns of the same name.
//!
//! [`encoder`] encodes each row as a bare Avro binary datum, with complex features (arrays,
//! structs, maps) encoded separately and embedded as bytes.
//!
//! [`delivery`] publishes encoded rows to the feature group's topic with at-least-once semantics.
//! A full producer queue makes the publisher wait, fatal broker errors abort the batch.
//! [`IngestionSession`](session::IngestionSession) owns the producer and encoders of one ingestion
//! and can be reused across the parts of a multi-part insert.
//!
//! [`materialization`] runs (and possibly schedules) the job copying the published rows to offline
//! storage, resuming from a [`Checkpoint`](checkpoint::Checkpoint) of topic offsets.
//!
//! Remote calls (registering feature groups, running jobs, tracking online ingestions, data
//! validation) are abstracted by the traits of [`collaborators`].
//!
//! # Logging
//!
//! The crate logs through the [`log`] facade under the `featurestore` target, with structured
//! key-values.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod checkpoint;
pub mod collaborators;
pub mod delivery;
pub mod encoder;
pub mod feature;
pub mod feature_group;
pub mod materialization;
pub mod schema;
pub mod session;
pub mod training_dataset;
pub mod transformation;
pub mod value;
pub mod write_options;

mod error;

pub use error::{Error, Result};
pub use feature::Feature;
pub use feature_group::FeatureGroup;
pub use value::FeatureValue;
