//! Writers for the storage layouts a feature group can have.
//!
//! Streaming feature groups (and online-enabled external ones) are written row by row through the
//! feature group's topic. Batch feature groups are written as one Parquet file that an ingestion
//! job picks up.
use arrow::array::RecordBatch;
use parquet::arrow::ArrowWriter;

use featurestore_core::{
    collaborators::Job,
    delivery::{self, Broker, BrokerConfig},
    feature_group::TimeTravelFormat,
    materialization::MaterializationCoordinator,
    schema::cast_to_schema,
    session::IngestionSession,
    write_options::WriteOptions,
    Error, FeatureGroup, Result,
};

use crate::Platform;

/// Writes dataframes into one kind of feature group.
pub trait WriteEngine {
    /// Write `batch` into `fg`, whose schema it already matches.
    ///
    /// `session` is the caller's session of a multi-part insert. Returns the job that moves the
    /// rows to offline storage, `None` if the feature group has none.
    fn save(
        &self,
        fg: &FeatureGroup,
        batch: &RecordBatch,
        options: &WriteOptions,
        session: Option<&mut IngestionSession>,
    ) -> Result<Option<Job>>;

    /// Delete the rows whose primary keys are listed in `keys`.
    fn delete_record(&self, fg: &FeatureGroup, _keys: &RecordBatch) -> Result<()> {
        match fg.time_travel_format {
            TimeTravelFormat::Hudi | TimeTravelFormat::Delta => Err(Error::Unsupported(format!(
                "deleting records of {:?} feature group '{}' requires a Spark engine",
                fg.time_travel_format, fg.name
            ))),
            TimeTravelFormat::None => Err(Error::InvalidArgument(format!(
                "feature group '{}' does not support deleting records, it has no time travel format",
                fg.name
            ))),
        }
    }

    /// Remove data files no longer referenced by commits younger than `retention_hours`.
    fn vacuum(&self, fg: &FeatureGroup, retention_hours: Option<u32>) -> Result<()> {
        match fg.time_travel_format {
            TimeTravelFormat::Hudi => {
                log::info!(target: "featurestore",
                    feature_group = fg.name.as_str(), retention_hours = retention_hours;
                    "Hudi feature groups clean up old files on write, nothing to vacuum");
                Ok(())
            }
            TimeTravelFormat::Delta => Err(Error::Unsupported(format!(
                "vacuuming Delta feature group '{}' requires a Spark engine",
                fg.name
            ))),
            TimeTravelFormat::None => Err(Error::InvalidArgument(format!(
                "feature group '{}' cannot be vacuumed, it has no time travel format",
                fg.name
            ))),
        }
    }
}

/// Select the writer for `fg`.
pub(crate) fn writer_for<'a, P: Platform>(
    fg: &FeatureGroup,
    platform: &'a P,
    broker: &'a dyn Broker,
    external_client: bool,
) -> Box<dyn WriteEngine + 'a> {
    if fg.writes_to_stream() {
        Box::new(StreamWriter {
            platform,
            broker,
            external_client,
        })
    } else {
        Box::new(UploadWriter { platform })
    }
}

/// Publishes rows to the feature group's topic and triggers materialization.
pub struct StreamWriter<'a, P> {
    platform: &'a P,
    broker: &'a dyn Broker,
    external_client: bool,
}

impl<'a, P: Platform> StreamWriter<'a, P> {
    pub fn new(platform: &'a P, broker: &'a dyn Broker, external_client: bool) -> Self {
        StreamWriter {
            platform,
            broker,
            external_client,
        }
    }
}

impl<P: Platform> WriteEngine for StreamWriter<'_, P> {
    fn save(
        &self,
        fg: &FeatureGroup,
        batch: &RecordBatch,
        options: &WriteOptions,
        session: Option<&mut IngestionSession>,
    ) -> Result<Option<Job>> {
        let config = BrokerConfig::resolve(
            self.platform,
            fg.feature_store_id,
            self.external_client,
            options,
        )?;

        let mut local = IngestionSession::new();
        let session = session.unwrap_or(&mut local);
        let multi_part = session.is_multi_part();
        let num_entries = (!multi_part).then_some(batch.num_rows() as i64);
        session.open(fg, self.broker, &config, self.platform, num_entries)?;
        let topic = fg.online_topic()?;

        // parts of a multi-part insert are not checkpointed
        let source = if multi_part {
            None
        } else {
            Some(self.broker.watermark_source(&config)?)
        };
        let checkpoint_before = match &source {
            Some(source) => delivery::watermarks(source.as_ref(), topic, true)?,
            None => None,
        };

        session.publish_batch(batch)?;
        if !multi_part {
            session.close()?;
        }

        let coordinator = MaterializationCoordinator::new(self.platform, self.platform);
        coordinator.after_batch(
            fg,
            checkpoint_before.as_ref(),
            || match &source {
                Some(source) => delivery::watermarks(source.as_ref(), topic, false),
                None => Ok(None),
            },
            multi_part,
            options,
        )
    }
}

/// Uploads the dataframe as Parquet and runs the feature group's ingestion job.
pub struct UploadWriter<'a, P> {
    platform: &'a P,
}

impl<'a, P: Platform> UploadWriter<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        UploadWriter { platform }
    }
}

impl<P: Platform> WriteEngine for UploadWriter<'_, P> {
    fn save(
        &self,
        fg: &FeatureGroup,
        batch: &RecordBatch,
        options: &WriteOptions,
        _session: Option<&mut IngestionSession>,
    ) -> Result<Option<Job>> {
        let ingestion = self.platform.ingestion_job(fg, &options.job_write_options)?;

        let batch = cast_to_schema(batch, &fg.features)?;
        let content = to_parquet(&batch)?;
        let remote_path = format!(
            "{}/{}_{}.parquet",
            ingestion.data_path.trim_end_matches('/'),
            fg.name,
            fg.version.unwrap_or(1)
        );
        log::debug!(target: "featurestore",
            feature_group = fg.name.as_str(), rows = batch.num_rows(), path = remote_path.as_str();
            "uploading dataframe");
        self.platform.upload(content, &remote_path)?;

        let wait = options.wait_for_job(true);
        log::info!(target: "featurestore",
            feature_group = fg.name.as_str(), job = ingestion.job.name.as_str(), wait = wait;
            "running ingestion job");
        self.platform.run(&ingestion.job, "", wait)?;
        Ok(Some(ingestion.job))
    }
}

fn to_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let parquet_error = |e: parquet::errors::ParquetError| Error::Encoding(format!("parquet: {e}"));

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None).map_err(parquet_error)?;
    writer.write(batch).map_err(parquet_error)?;
    writer.close().map_err(parquet_error)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int64Array};
    use bytes::Bytes;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    use super::*;
    use featurestore_core::Feature;

    #[test]
    fn parquet_content_round_trips_rows() {
        let batch =
            RecordBatch::try_from_iter([("id", Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef)])
                .unwrap();
        let fg = FeatureGroup {
            features: vec![Feature::new("id", "bigint")],
            ..FeatureGroup::new(1, "fg", Some(1))
        };

        let content = to_parquet(&cast_to_schema(&batch, &fg.features).unwrap()).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(content))
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 3);
    }
}
