use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use arrow::{
    array::{
        ArrayRef, AsArray, Float64Array, Int64Array, RecordBatch, StringArray,
        TimestampMicrosecondArray, TimestampMillisecondArray,
    },
    datatypes::{DataType, TimeUnit, TimestampMicrosecondType},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use featurestore::{
    feature_group_engine::{InsertOptions, Storage, ValidationOptions},
    Error, Feature, FeatureGroup, FeatureGroupEngine, FeatureGroupKind, IngestionSession, Job,
    TimeTravelFormat, TransformationContext, TransformationFunctionBinding, WriteOptions,
};
use featurestore_core::{
    collaborators::{
        Commit, Execution, FeatureGroupApi, FeatureGroupMetadata, IngestionJob,
        KafkaConfigResolver, MaterializationJob, MetadataUpdate, OnlineIngestion,
        OnlineIngestionApi, ValidationGate, ValidationIngestionResult, ValidationReport,
    },
    delivery::{
        self, Broker, BrokerConfig, DeliveryTracker, MessageProducer, OutgoingMessage,
        ProduceError, WatermarkSource,
    },
    Result,
};

const TOPIC: &str = "fg_13_topic";

// In-memory broker with a single partition per topic.

#[derive(Debug, Clone)]
struct Message {
    key: String,
    payload: Vec<u8>,
    headers: Vec<(String, String)>,
}

type Topics = Arc<Mutex<BTreeMap<String, Vec<Message>>>>;

#[derive(Default)]
struct MemoryBroker {
    topics: Topics,
    producers: Mutex<usize>,
}

impl MemoryBroker {
    fn with_topic(topic: &str, messages: usize) -> MemoryBroker {
        let broker = MemoryBroker::default();
        broker.topics.lock().unwrap().insert(
            topic.to_owned(),
            vec![
                Message {
                    key: String::new(),
                    payload: vec![],
                    headers: vec![],
                };
                messages
            ],
        );
        broker
    }

    fn messages(&self, topic: &str) -> Vec<Message> {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }
}

struct MemoryProducer {
    topics: Topics,
    tracker: DeliveryTracker,
    pending: usize,
}

impl MessageProducer for MemoryProducer {
    fn send(&mut self, message: OutgoingMessage<'_>) -> std::result::Result<(), ProduceError> {
        self.topics
            .lock()
            .unwrap()
            .entry(message.topic.to_owned())
            .or_default()
            .push(Message {
                key: message.key.to_owned(),
                payload: message.payload.to_vec(),
                headers: message.headers.to_vec(),
            });
        self.pending += 1;
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) {}

    fn flush(&mut self) -> Result<()> {
        for _ in 0..self.pending {
            self.tracker.record_delivered();
        }
        self.pending = 0;
        Ok(())
    }
}

struct MemoryWatermarks {
    topics: Topics,
}

impl WatermarkSource for MemoryWatermarks {
    fn partitions(&self, topic: &str) -> Result<Option<Vec<i32>>> {
        Ok(self.topics.lock().unwrap().get(topic).map(|_| vec![0]))
    }

    fn watermarks(&self, topic: &str, _partition: i32) -> Result<(i64, i64)> {
        let len = self.topics.lock().unwrap().get(topic).map_or(0, Vec::len);
        Ok((0, len as i64))
    }
}

impl Broker for MemoryBroker {
    fn producer(
        &self,
        _config: &BrokerConfig,
        tracker: DeliveryTracker,
    ) -> Result<Box<dyn MessageProducer>> {
        *self.producers.lock().unwrap() += 1;
        Ok(Box::new(MemoryProducer {
            topics: Arc::clone(&self.topics),
            tracker,
            pending: 0,
        }))
    }

    fn watermark_source(&self, _config: &BrokerConfig) -> Result<Box<dyn WatermarkSource>> {
        Ok(Box::new(MemoryWatermarks {
            topics: Arc::clone(&self.topics),
        }))
    }
}

// Platform recording every call.

#[derive(Default)]
struct FakePlatform {
    executed_before: bool,
    fail_updates: bool,
    saved: Mutex<Vec<FeatureGroupMetadata>>,
    updates: Mutex<Vec<(FeatureGroupMetadata, MetadataUpdate)>>,
    deleted: Mutex<usize>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
    runs: Mutex<Vec<(String, String, bool)>>,
    schedules: Mutex<Vec<(String, DateTime<Utc>)>>,
    online_ingestions: Mutex<Vec<Option<i64>>>,
}

impl FakePlatform {
    fn runs(&self) -> Vec<(String, String, bool)> {
        self.runs.lock().unwrap().clone()
    }
}

fn materialization_job() -> Job {
    let mut job = Job::new("fg_1_offline_fg_materialization");
    job.config.default_args = Some("-op offline_fg_materialization".to_owned());
    job
}

impl FeatureGroupApi for FakePlatform {
    fn save(&self, fg: &FeatureGroup) -> Result<FeatureGroupMetadata> {
        let metadata = FeatureGroupMetadata {
            id: Some(13),
            online_topic_name: Some(TOPIC.to_owned()),
            materialization_job: Some(materialization_job()),
            ..FeatureGroupMetadata::from(fg)
        };
        self.saved.lock().unwrap().push(metadata.clone());
        Ok(metadata)
    }

    fn update_metadata(
        &self,
        fg: &FeatureGroup,
        update: MetadataUpdate,
    ) -> Result<FeatureGroupMetadata> {
        if self.fail_updates {
            return Err(Error::FeatureStore("update rejected".to_owned()));
        }
        let metadata = FeatureGroupMetadata::from(fg);
        self.updates
            .lock()
            .unwrap()
            .push((metadata.clone(), update));
        Ok(metadata)
    }

    fn delete_content(&self, _fg: &FeatureGroup) -> Result<()> {
        *self.deleted.lock().unwrap() += 1;
        Ok(())
    }

    fn commit_details(
        &self,
        _fg: &FeatureGroup,
        _wallclock_time: Option<i64>,
        _limit: Option<usize>,
    ) -> Result<Vec<Commit>> {
        Ok(vec![Commit {
            commit_id: 20240101000000,
            commit_date_string: None,
            rows_inserted: 3,
            rows_updated: 0,
            rows_deleted: 0,
        }])
    }

    fn ingestion_job(
        &self,
        _fg: &FeatureGroup,
        _write_options: &BTreeMap<String, String>,
    ) -> Result<IngestionJob> {
        Ok(IngestionJob {
            data_path: "/apps/ingestion/".to_owned(),
            job: Job::new("fg_1_ingestion"),
        })
    }

    fn upload(&self, content: Vec<u8>, remote_path: &str) -> Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((remote_path.to_owned(), content));
        Ok(())
    }
}

impl KafkaConfigResolver for FakePlatform {
    fn kafka_config(
        &self,
        _feature_store_id: i64,
        _external: bool,
    ) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::from([(
            "bootstrap.servers".to_owned(),
            "localhost:9092".to_owned(),
        )]))
    }
}

impl MaterializationJob for FakePlatform {
    fn run(&self, job: &Job, args: &str, await_termination: bool) -> Result<Execution> {
        self.runs
            .lock()
            .unwrap()
            .push((job.name.clone(), args.to_owned(), await_termination));
        Ok(Execution::default())
    }

    fn schedule(&self, job: &Job, _cron_expression: &str, start_time: DateTime<Utc>) -> Result<()> {
        self.schedules
            .lock()
            .unwrap()
            .push((job.name.clone(), start_time));
        Ok(())
    }

    fn last_execution(&self, _job: &Job) -> Result<Option<Execution>> {
        Ok(self.executed_before.then(Execution::default))
    }
}

impl OnlineIngestionApi for FakePlatform {
    fn create(&self, _fg: &FeatureGroup, num_entries: Option<i64>) -> Result<OnlineIngestion> {
        self.online_ingestions.lock().unwrap().push(num_entries);
        Ok(OnlineIngestion {
            id: 42,
            num_entries,
            results: vec![],
        })
    }

    fn latest(&self, _fg: &FeatureGroup) -> Result<Option<OnlineIngestion>> {
        Ok(None)
    }

    fn get(&self, _fg: &FeatureGroup, id: i64) -> Result<OnlineIngestion> {
        Ok(OnlineIngestion {
            id,
            ..OnlineIngestion::default()
        })
    }
}

struct RejectEverything;

impl ValidationGate for RejectEverything {
    fn validate(&self, _fg: &FeatureGroup, _batch: &RecordBatch) -> Result<Option<ValidationReport>> {
        Ok(Some(ValidationReport {
            success: false,
            ingestion_result: ValidationIngestionResult::Rejected,
            url: "https://cluster.ai/report/1".to_owned(),
        }))
    }
}

fn engine(
    platform: &Arc<FakePlatform>,
    broker: &Arc<MemoryBroker>,
) -> FeatureGroupEngine<FakePlatform> {
    let _ = env_logger::builder().is_test(true).try_init();
    FeatureGroupEngine::new(Arc::clone(platform)).with_broker(Arc::clone(broker) as Arc<dyn Broker>)
}

fn new_feature_group() -> FeatureGroup {
    FeatureGroup {
        project_id: 119,
        primary_key: vec!["id".to_owned()],
        kind: FeatureGroupKind::Streaming,
        ..FeatureGroup::new(67, "transactions", Some(1))
    }
}

fn registered_feature_group() -> FeatureGroup {
    FeatureGroup {
        id: Some(13),
        features: vec![
            Feature::new("id", "bigint").with_primary(),
            Feature::new("amount", "double"),
        ],
        online_topic_name: Some(TOPIC.to_owned()),
        materialization_job: Some(materialization_job()),
        ..new_feature_group()
    }
}

fn batch(ids: &[i64]) -> RecordBatch {
    RecordBatch::try_from_iter([
        ("id", Arc::new(Int64Array::from(ids.to_vec())) as ArrayRef),
        (
            "amount",
            Arc::new(Float64Array::from_iter_values(ids.iter().map(|i| *i as f64 * 1.5))) as ArrayRef,
        ),
    ])
    .unwrap()
}

#[test]
fn first_insert_registers_and_materializes_from_low_watermarks() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = new_feature_group();

    let (job, report) = engine
        .insert(
            &mut fg,
            &batch(&[1, 2, 3]),
            &InsertOptions::new(),
            &WriteOptions::new().with_offline_backfill_every_hr(6u32),
            None,
        )
        .unwrap();

    assert_eq!(fg.id, Some(13));
    assert_eq!(job, Some(materialization_job()));
    assert!(report.is_none());
    assert_eq!(
        platform.saved.lock().unwrap()[0]
            .features
            .iter()
            .map(|f| (f.name.as_str(), f.primary))
            .collect::<Vec<_>>(),
        vec![("id", true), ("amount", false)]
    );

    let messages = broker.messages(TOPIC);
    assert_eq!(
        messages.iter().map(|m| m.key.as_str()).collect::<Vec<_>>(),
        vec!["1", "2", "3"]
    );
    assert!(messages[0]
        .headers
        .contains(&("featureGroupId".to_owned(), "13".to_owned())));
    assert!(messages[0]
        .headers
        .contains(&("projectId".to_owned(), "119".to_owned())));

    assert_eq!(
        platform.runs(),
        vec![(
            "fg_1_offline_fg_materialization".to_owned(),
            format!("-op offline_fg_materialization -initialCheckPointString {TOPIC},0:0"),
            false
        )]
    );
    assert_eq!(platform.schedules.lock().unwrap().len(), 1);
}

#[test]
fn first_insert_without_backfill_interval_is_not_scheduled() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = new_feature_group();

    engine
        .insert(
            &mut fg,
            &batch(&[1, 2, 3]),
            &InsertOptions::new(),
            &WriteOptions::new().with_start_offline_materialization(false),
            None,
        )
        .unwrap();

    // a new topic is always materialized
    assert_eq!(platform.runs().len(), 1);
    assert!(platform.schedules.lock().unwrap().is_empty());
}

#[test]
fn later_inserts_resume_from_checkpoint() {
    let platform = Arc::new(FakePlatform {
        executed_before: true,
        ..FakePlatform::default()
    });
    let broker = Arc::new(MemoryBroker::with_topic(TOPIC, 5));
    let engine = engine(&platform, &broker);
    let mut fg = registered_feature_group();

    let source = broker.watermark_source(&BrokerConfig::default()).unwrap();
    let before = delivery::watermarks(source.as_ref(), TOPIC, true)
        .unwrap()
        .unwrap();

    engine
        .insert(
            &mut fg,
            &batch(&[4, 5, 6]),
            &InsertOptions::new(),
            &WriteOptions::new().with_wait_for_job(true),
            None,
        )
        .unwrap();

    let after = delivery::watermarks(source.as_ref(), TOPIC, true)
        .unwrap()
        .unwrap();
    assert!(after.dominates(&before));
    assert_eq!(after.offset(0), Some(8));

    assert_eq!(
        platform.runs(),
        vec![(
            "fg_1_offline_fg_materialization".to_owned(),
            format!("-op offline_fg_materialization -initialCheckPointString {TOPIC},0:5"),
            true
        )]
    );
    assert!(platform.saved.lock().unwrap().is_empty());
}

#[test]
fn incompatible_dataframe_publishes_nothing() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = registered_feature_group();

    let batch = RecordBatch::try_from_iter([
        ("id", Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef),
        ("amount", Arc::new(Float64Array::from(vec![1.0, 2.0])) as ArrayRef),
        ("country", Arc::new(StringArray::from(vec!["SE", "DE"])) as ArrayRef),
    ])
    .unwrap();

    let err = engine
        .insert(&mut fg, &batch, &InsertOptions::new(), &WriteOptions::new(), None)
        .unwrap_err();

    match err {
        Error::SchemaMismatch { mismatches } => {
            assert_eq!(mismatches, vec!["country (not in feature group)".to_owned()])
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(broker.messages(TOPIC).is_empty());
    assert!(platform.runs().is_empty());
}

#[test]
fn transformation_output_replacing_input_is_last() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = new_feature_group();
    fg.transformation_functions = vec![TransformationFunctionBinding::row_wise(
        "double_amount",
        ["amount"],
        [("amount", "double")],
        |values, _| Ok(vec![values[0].as_f64().map(|v| v * 2.0).into()]),
    )];

    let batch = RecordBatch::try_from_iter([
        ("id", Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef),
        ("amount", Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0])) as ArrayRef),
        ("country", Arc::new(StringArray::from(vec!["SE", "DE", "FR"])) as ArrayRef),
    ])
    .unwrap();

    engine
        .insert(&mut fg, &batch, &InsertOptions::new(), &WriteOptions::new(), None)
        .unwrap();

    let names: Vec<&str> = fg.features.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["id", "country", "amount"]);
    assert!(fg.features[2].on_demand);
    assert_eq!(broker.messages(TOPIC).len(), 3);
}

#[test]
fn multi_part_insert_shares_one_producer() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = new_feature_group();
    let mut session = IngestionSession::multi_part();

    for part in [&[1, 2][..], &[3, 4, 5][..]] {
        engine
            .insert(
                &mut fg,
                &batch(part),
                &InsertOptions::new(),
                &WriteOptions::new(),
                Some(&mut session),
            )
            .unwrap();
    }
    session.close().unwrap();

    assert_eq!(*broker.producers.lock().unwrap(), 1);
    assert_eq!(session.published(), 5);
    assert_eq!(broker.messages(TOPIC).len(), 5);
    // parts are never checkpointed
    assert!(platform
        .runs()
        .iter()
        .all(|(_, args, _)| args == "-op offline_fg_materialization"));
}

#[test]
fn online_feature_groups_track_online_ingestion() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = new_feature_group();
    fg.online_enabled = true;

    engine
        .insert(&mut fg, &batch(&[1, 2, 3]), &InsertOptions::new(), &WriteOptions::new(), None)
        .unwrap();

    assert_eq!(*platform.online_ingestions.lock().unwrap(), vec![Some(3)]);
    assert!(broker.messages(TOPIC)[0]
        .headers
        .contains(&("onlineIngestionId".to_owned(), "42".to_owned())));
}

#[test]
fn online_storage_requires_online_feature_group() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = registered_feature_group();

    let err = engine
        .insert(
            &mut fg,
            &batch(&[1]),
            &InsertOptions::new().with_storage(Storage::Online),
            &WriteOptions::new(),
            None,
        )
        .unwrap_err();

    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(broker.messages(TOPIC).is_empty());
}

#[test]
fn overwrite_deletes_content_first() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = registered_feature_group();

    engine
        .insert(
            &mut fg,
            &batch(&[1]),
            &InsertOptions::new().with_overwrite(true),
            &WriteOptions::new(),
            None,
        )
        .unwrap();

    assert_eq!(*platform.deleted.lock().unwrap(), 1);
}

#[test]
fn rejected_dataframes_are_not_written() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker).with_validation(Arc::new(RejectEverything));

    let mut fg = registered_feature_group();
    let err = engine
        .insert(&mut fg, &batch(&[1]), &InsertOptions::new(), &WriteOptions::new(), None)
        .unwrap_err();
    assert!(matches!(err, Error::ValidationRejected { .. }));

    let mut fg = new_feature_group();
    let (job, report) = engine
        .save(&mut fg, &batch(&[1]), &WriteOptions::new(), ValidationOptions::default())
        .unwrap();
    assert!(job.is_none());
    assert!(report.unwrap().is_rejected());
    // the feature group is registered even though no row is written
    assert!(fg.is_registered());

    let skipped = InsertOptions::new().with_validation(ValidationOptions {
        run_validation: false,
        ..ValidationOptions::default()
    });
    let mut fg = registered_feature_group();
    engine
        .insert(&mut fg, &batch(&[1]), &skipped, &WriteOptions::new(), None)
        .unwrap();

    assert_eq!(broker.messages(TOPIC).len(), 1);
}

#[test]
fn batch_feature_groups_upload_parquet() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = FeatureGroup {
        kind: FeatureGroupKind::Batch,
        ..new_feature_group()
    };

    let (job, _) = engine
        .save(&mut fg, &batch(&[1, 2, 3]), &WriteOptions::new(), ValidationOptions::default())
        .unwrap();

    assert_eq!(job, Some(Job::new("fg_1_ingestion")));
    let uploads = platform.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "/apps/ingestion/transactions_1.parquet");
    assert!(!uploads[0].1.is_empty());
    assert_eq!(
        platform.runs(),
        vec![("fg_1_ingestion".to_owned(), String::new(), true)]
    );
    assert!(broker.messages(TOPIC).is_empty());
}

const EVENT_MICROS: [i64; 2] = [1_700_000_000_000_000, 1_700_000_060_000_000];

fn events(event_time: ArrayRef) -> RecordBatch {
    RecordBatch::try_from_iter([
        ("id", Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef),
        ("event_time", event_time),
    ])
    .unwrap()
}

fn utc_events() -> RecordBatch {
    events(Arc::new(
        TimestampMicrosecondArray::from(EVENT_MICROS.to_vec()).with_timezone("UTC"),
    ))
}

fn event_feature_group(kind: FeatureGroupKind) -> FeatureGroup {
    FeatureGroup {
        kind,
        event_time: Some("event_time".to_owned()),
        ..new_feature_group()
    }
}

#[test]
fn event_time_feature_groups_stream_timestamps() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = event_feature_group(FeatureGroupKind::Streaming);

    engine
        .insert(&mut fg, &utc_events(), &InsertOptions::new(), &WriteOptions::new(), None)
        .unwrap();
    assert_eq!(
        fg.features
            .iter()
            .map(|f| (f.name.as_str(), f.feature_type.as_deref()))
            .collect::<Vec<_>>(),
        vec![("id", Some("bigint")), ("event_time", Some("timestamp"))]
    );

    let naive = events(Arc::new(TimestampMillisecondArray::from(
        EVENT_MICROS.iter().map(|t| t / 1000).collect::<Vec<_>>(),
    )));
    engine
        .insert(&mut fg, &naive, &InsertOptions::new(), &WriteOptions::new(), None)
        .unwrap();

    let messages = broker.messages(TOPIC);
    assert_eq!(messages.len(), 4);
    assert!(!messages[0].payload.is_empty());
    assert_ne!(messages[0].payload, messages[1].payload);
    assert_eq!(messages[0].payload, messages[2].payload);
    assert_eq!(messages[1].payload, messages[3].payload);
}

#[test]
fn event_time_feature_groups_upload_timestamps() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = event_feature_group(FeatureGroupKind::Batch);

    engine
        .insert(&mut fg, &utc_events(), &InsertOptions::new(), &WriteOptions::new(), None)
        .unwrap();

    let uploads = platform.uploads.lock().unwrap().clone();
    assert_eq!(uploads.len(), 1);
    let batches = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(uploads[0].1.clone()))
        .unwrap()
        .build()
        .unwrap()
        .collect::<std::result::Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(batches.len(), 1);
    let event_time = batches[0].column_by_name("event_time").unwrap();
    assert!(matches!(
        event_time.data_type(),
        DataType::Timestamp(TimeUnit::Microsecond, Some(_))
    ));
    assert_eq!(
        event_time.as_primitive::<TimestampMicrosecondType>().values().to_vec(),
        EVENT_MICROS.to_vec()
    );
}

#[test]
fn time_travel_operations_dispatch_on_format() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let keys = batch(&[1]);

    let mut fg = registered_feature_group();
    assert!(matches!(
        engine.vacuum(&fg, Some(24)),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.commit_details(&fg, None, None),
        Err(Error::InvalidArgument(_))
    ));

    fg.time_travel_format = TimeTravelFormat::Hudi;
    engine.vacuum(&fg, None).unwrap();
    assert!(matches!(
        engine.delete_records(&fg, &keys),
        Err(Error::Unsupported(_))
    ));
    assert_eq!(engine.commit_details(&fg, None, Some(1)).unwrap().len(), 1);

    fg.time_travel_format = TimeTravelFormat::Delta;
    assert!(matches!(engine.vacuum(&fg, None), Err(Error::Unsupported(_))));

    assert!(matches!(
        engine.insert_stream(&fg),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn metadata_updates_apply_only_when_accepted() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = registered_feature_group();

    engine
        .update_description(&mut fg, "card transactions")
        .unwrap();
    engine
        .append_features(&mut fg, &[Feature::new("country", "string")])
        .unwrap();
    engine
        .update_features(&mut fg, &[Feature::new("amount", "float")])
        .unwrap();
    engine.update_deprecated(&mut fg, true).unwrap();

    assert_eq!(fg.description.as_deref(), Some("card transactions"));
    assert_eq!(
        fg.features
            .iter()
            .map(|f| (f.name.as_str(), f.feature_type.as_deref()))
            .collect::<Vec<_>>(),
        vec![
            ("id", Some("bigint")),
            ("amount", Some("float")),
            ("country", Some("string")),
        ]
    );
    assert_eq!(
        platform.updates.lock().unwrap().last().unwrap().1,
        MetadataUpdate::Deprecate(true)
    );
    assert!(matches!(
        engine.append_features(&mut fg, &[Feature::new("id", "bigint")]),
        Err(Error::InvalidArgument(_))
    ));

    let failing = Arc::new(FakePlatform {
        fail_updates: true,
        ..FakePlatform::default()
    });
    let engine = FeatureGroupEngine::new(Arc::clone(&failing));
    let mut fg = registered_feature_group();
    assert!(engine
        .update_notification_topic_name(&mut fg, "fg_notifications")
        .is_err());
    assert_eq!(fg.notification_topic_name, None);
}

#[test]
fn row_wise_functions_receive_context() {
    let platform = Arc::new(FakePlatform::default());
    let broker = Arc::new(MemoryBroker::default());
    let engine = engine(&platform, &broker);
    let mut fg = new_feature_group();
    fg.transformation_functions = vec![TransformationFunctionBinding::row_wise(
        "with_rate",
        ["amount"],
        [("amount_eur", "double")],
        |values, context| {
            let rate = context
                .and_then(|c| c.get("rate"))
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0);
            Ok(vec![values[0].as_f64().map(|v| v * rate).into()])
        },
    )];
    let context = TransformationContext::from([("rate".to_owned(), serde_json::json!(0.5))]);

    engine
        .insert(
            &mut fg,
            &batch(&[2]),
            &InsertOptions::new().with_transformation_context(&context),
            &WriteOptions::new(),
            None,
        )
        .unwrap();

    assert_eq!(
        fg.features.last().map(|f| f.name.as_str()),
        Some("amount_eur")
    );
    assert_eq!(broker.messages(TOPIC).len(), 1);
}
