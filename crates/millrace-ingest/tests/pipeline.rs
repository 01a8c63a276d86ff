//! End-to-end pipeline tests: provision, consume, sink, checkpoint.

use millrace_core::{MissingIdPolicy, StreamType, TelemetryDecoder};
use millrace_ingest::{
    CheckpointPolicy, CheckpointStore, ConsumerConfig, DocumentStore, IdempotentSink, MemoryLog,
    PartitionedLog, RocksCheckpointStore, RocksStore, SchemaProvisioner, StartPosition,
    StreamProcessor, TelemetryPipeline,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

fn scada_config(start: StartPosition) -> ConsumerConfig {
    ConsumerConfig {
        group: "millrace-ingest".to_string(),
        topic: "scada-events".to_string(),
        stream_id: "scada".to_string(),
        start,
        policy: CheckpointPolicy::EveryRecord,
    }
}

async fn provisioned_store(tmp: &TempDir) -> Arc<RocksStore> {
    let store = Arc::new(RocksStore::new(tmp.path().join("store"), "telemetry"));
    let provisioner = SchemaProvisioner::new(Arc::clone(&store) as Arc<dyn DocumentStore>);
    provisioner
        .ensure(&StreamType::Scada.descriptor())
        .await
        .unwrap();
    store
}

fn scada_pipeline(store: &Arc<RocksStore>) -> Arc<TelemetryPipeline> {
    let descriptor = StreamType::Scada.descriptor();
    Arc::new(TelemetryPipeline::new(
        TelemetryDecoder::new(&descriptor, MissingIdPolicy::default()),
        IdempotentSink::new(
            Arc::clone(store) as Arc<dyn DocumentStore>,
            descriptor.collection,
        ),
    ))
}

/// Run the scada processor over the log until all partitions are revoked.
async fn drain(
    log: Arc<MemoryLog>,
    store: &Arc<RocksStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    partitions: u32,
    start: StartPosition,
) {
    let revokes: Vec<_> = (0..partitions)
        .map(|p| log.revoke_handle("scada-events", p))
        .collect();
    let (_tx, rx) = watch::channel(false);

    let processor = StreamProcessor::new(
        log as Arc<dyn PartitionedLog>,
        checkpoints,
        scada_pipeline(store),
        scada_config(start),
    );
    let handle = processor.start(rx).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    for revoke in revokes {
        revoke.revoke();
    }
    let stats = handle.join().await;
    assert!(stats.is_clean());
}

#[tokio::test]
async fn scenario_provision_write_redeliver() {
    // Provisioning an empty target creates the collection and the
    // composite index; a record written and then redelivered unchanged
    // lands exactly once.
    let tmp = TempDir::new().unwrap();
    let store = provisioned_store(&tmp).await;

    assert_eq!(
        store.composite_indexes("scada_events").await.unwrap(),
        StreamType::Scada.descriptor().required_composite_indexes
    );

    let log = Arc::new(MemoryLog::new(1));
    let payload = br#"{"id":"e1","MachineID":"M1","temperature":42.0}"#;
    log.append("scada-events", 0, payload).await.unwrap();
    log.append("scada-events", 0, payload).await.unwrap(); // redelivery

    let checkpoints = Arc::new(RocksCheckpointStore::open(tmp.path().join("cp")).unwrap());
    drain(
        Arc::clone(&log),
        &store,
        Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
        1,
        StartPosition::Earliest,
    )
    .await;

    assert_eq!(store.count("scada_events").await.unwrap(), 1);
    let doc = store.get("scada_events", "e1").await.unwrap().unwrap();
    assert_eq!(doc["temperature"], 42.0);
    assert_eq!(doc["MachineID"], "M1");

    // Both deliveries checkpointed.
    let cp = checkpoints
        .load("millrace-ingest", "scada-events", 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cp.offset, 1);
}

#[tokio::test]
async fn scenario_malformed_record_does_not_halt_partition() {
    let tmp = TempDir::new().unwrap();
    let store = provisioned_store(&tmp).await;

    let log = Arc::new(MemoryLog::new(1));
    log.append(
        "scada-events",
        0,
        br#"{"id":"e1","MachineID":"M1","temperature":1.0}"#,
    )
    .await
    .unwrap();
    log.append("scada-events", 0, b"{{{ not json").await.unwrap();
    log.append(
        "scada-events",
        0,
        br#"{"id":"e2","MachineID":"M1","temperature":2.0}"#,
    )
    .await
    .unwrap();

    let checkpoints = Arc::new(RocksCheckpointStore::open(tmp.path().join("cp")).unwrap());
    drain(
        Arc::clone(&log),
        &store,
        Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
        1,
        StartPosition::Earliest,
    )
    .await;

    // Both valid records landed; the malformed one was skipped but still
    // checkpointed past.
    assert_eq!(store.count("scada_events").await.unwrap(), 2);
    assert!(store.get("scada_events", "e2").await.unwrap().is_some());
    assert_eq!(
        checkpoints
            .load("millrace-ingest", "scada-events", 0)
            .await
            .unwrap()
            .unwrap()
            .offset,
        2
    );
}

#[tokio::test]
async fn scenario_crash_between_write_and_checkpoint_replays_safely() {
    let tmp = TempDir::new().unwrap();
    let store = provisioned_store(&tmp).await;

    let log = Arc::new(MemoryLog::new(1));
    let payload = br#"{"id":"e1","MachineID":"M1","temperature":42.0}"#;
    log.append("scada-events", 0, payload).await.unwrap();

    // Simulate the first run crashing after the write committed but before
    // the checkpoint did: the document exists, the checkpoint does not.
    let descriptor = StreamType::Scada.descriptor();
    let sink = IdempotentSink::new(
        Arc::clone(&store) as Arc<dyn DocumentStore>,
        descriptor.collection,
    );
    let event = TelemetryDecoder::new(&descriptor, MissingIdPolicy::default())
        .decode(payload, 0, 0)
        .unwrap();
    sink.write(&event).await.unwrap();
    assert_eq!(store.count("scada_events").await.unwrap(), 1);

    // Restart: no checkpoint, so the record is redelivered and re-written.
    let checkpoints = Arc::new(RocksCheckpointStore::open(tmp.path().join("cp")).unwrap());
    drain(
        Arc::clone(&log),
        &store,
        Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
        1,
        StartPosition::Earliest,
    )
    .await;

    // The redelivery was absorbed by the upsert: still exactly one document.
    assert_eq!(store.count("scada_events").await.unwrap(), 1);
    assert_eq!(store.index_entry_count("scada_events").unwrap(), 1);
    assert_eq!(
        checkpoints
            .load("millrace-ingest", "scada-events", 0)
            .await
            .unwrap()
            .unwrap()
            .offset,
        0
    );
}

#[tokio::test]
async fn scenario_second_run_resumes_past_processed_records() {
    let tmp = TempDir::new().unwrap();
    let store = provisioned_store(&tmp).await;
    let checkpoints = Arc::new(RocksCheckpointStore::open(tmp.path().join("cp")).unwrap());

    let log = Arc::new(MemoryLog::new(1));
    log.append(
        "scada-events",
        0,
        br#"{"id":"e1","MachineID":"M1","temperature":1.0}"#,
    )
    .await
    .unwrap();

    drain(
        Arc::clone(&log),
        &store,
        Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
        1,
        StartPosition::Earliest,
    )
    .await;

    // More records arrive between runs.
    log.append(
        "scada-events",
        0,
        br#"{"id":"e2","MachineID":"M2","temperature":2.0}"#,
    )
    .await
    .unwrap();

    // The second run starts with `latest` configured, but the committed
    // checkpoint wins: e2 (after the checkpoint) is still delivered.
    drain(
        Arc::clone(&log),
        &store,
        Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
        1,
        StartPosition::Latest,
    )
    .await;

    assert_eq!(store.count("scada_events").await.unwrap(), 2);
    assert!(store.get("scada_events", "e2").await.unwrap().is_some());
}

#[tokio::test]
async fn scenario_records_without_id_land_once_under_synthesis() {
    let tmp = TempDir::new().unwrap();
    let store = provisioned_store(&tmp).await;

    let log = Arc::new(MemoryLog::new(1));
    let payload = br#"{"MachineID":"M7","temperature":3.5}"#;
    log.append("scada-events", 0, payload).await.unwrap();
    log.append("scada-events", 0, payload).await.unwrap(); // redelivery, same bytes

    let checkpoints = Arc::new(RocksCheckpointStore::open(tmp.path().join("cp")).unwrap());
    drain(
        Arc::clone(&log),
        &store,
        checkpoints as Arc<dyn CheckpointStore>,
        1,
        StartPosition::Earliest,
    )
    .await;

    // The synthesized id is deterministic, so the redelivery collapsed
    // into one document.
    assert_eq!(store.count("scada_events").await.unwrap(), 1);
}
