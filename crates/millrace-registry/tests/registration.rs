//! End-to-end registration flow: publish, consume, observe via the API.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use millrace_core::Mailbox;
use millrace_ingest::{
    CheckpointPolicy, CheckpointStore, ConsumerConfig, MemoryCheckpointStore, MemoryLog,
    PartitionedLog, RecordHandler, StartPosition, StreamProcessor,
};
use millrace_registry::{
    AgentRegistry, AppState, BackpressurePolicy, ControlHandler, MessagePublisher,
    PublisherConfig, router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;

const TOPIC: &str = "agent-requests";

struct Fixture {
    log: Arc<MemoryLog>,
    registry: Arc<AgentRegistry>,
    state: AppState,
    shutdown: watch::Sender<bool>,
    consumer: millrace_ingest::ProcessorHandle,
}

async fn start_fixture(partitions: u32) -> Fixture {
    let log = Arc::new(MemoryLog::new(partitions));
    let registry = Arc::new(AgentRegistry::new());
    let status = Mailbox::new();

    let (shutdown, shutdown_rx) = watch::channel(false);
    let processor = StreamProcessor::new(
        Arc::clone(&log) as Arc<dyn PartitionedLog>,
        Arc::new(MemoryCheckpointStore::new()) as Arc<dyn CheckpointStore>,
        Arc::new(ControlHandler::new(Arc::clone(&registry), status.clone()))
            as Arc<dyn RecordHandler>,
        ConsumerConfig {
            group: "millrace-registry".to_string(),
            topic: TOPIC.to_string(),
            stream_id: "registry".to_string(),
            start: StartPosition::Earliest,
            policy: CheckpointPolicy::EveryRecord,
        },
    );
    let consumer = processor.start(shutdown_rx).await.unwrap();

    let state = AppState::new(Arc::clone(&registry), status);
    Fixture {
        log,
        registry,
        state,
        shutdown,
        consumer,
    }
}

impl Fixture {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        let stats = self.consumer.join().await;
        assert!(stats.is_clean());
    }
}

async fn get_json(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_register_then_observe_through_api() {
    let fixture = start_fixture(4).await;

    let publisher = MessagePublisher::spawn(
        Arc::clone(&fixture.log) as Arc<dyn PartitionedLog>,
        PublisherConfig {
            topic: TOPIC.to_string(),
            capacity: 16,
            policy: BackpressurePolicy::Block,
        },
    );
    publisher
        .register_agent(
            "test-agent-001",
            "test-type",
            vec!["foo".to_string(), "bar".to_string()],
        )
        .await
        .unwrap();
    publisher.close().await;

    // Explicit completion signal instead of a fixed sleep.
    let record = fixture
        .registry
        .wait_for("test-agent-001", Duration::from_secs(5))
        .await
        .expect("agent registered");
    assert_eq!(record.agent_type, "test-type");

    let (status, agents) = get_json(fixture.state.clone(), "/agents").await;
    assert_eq!(status, StatusCode::OK);
    let agents = agents.as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["agent_id"], "test-agent-001");
    // Capabilities come back as a real array.
    assert_eq!(agents[0]["capabilities"], serde_json::json!(["foo", "bar"]));

    fixture.stop().await;
}

#[tokio::test]
async fn test_reregistration_replaces_entry() {
    let fixture = start_fixture(1).await;

    let publisher = MessagePublisher::spawn(
        Arc::clone(&fixture.log) as Arc<dyn PartitionedLog>,
        PublisherConfig {
            topic: TOPIC.to_string(),
            capacity: 16,
            policy: BackpressurePolicy::Block,
        },
    );
    publisher
        .register_agent("a1", "t", vec!["x".to_string(), "y".to_string()])
        .await
        .unwrap();
    publisher
        .register_agent("a1", "t", vec!["z".to_string()])
        .await
        .unwrap();
    publisher.close().await;

    // Wait until the second registration lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(record) = fixture.registry.get("a1") {
            if record.capabilities == vec!["z"] {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "second registration never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, agents) = get_json(fixture.state.clone(), "/agents").await;
    assert_eq!(status, StatusCode::OK);
    let agents = agents.as_array().unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["capabilities"], serde_json::json!(["z"]));

    fixture.stop().await;
}

#[tokio::test]
async fn test_get_agent_waits_for_registration() {
    let fixture = start_fixture(1).await;

    // Issue the lookup before the registration is published.
    let state = fixture.state.clone();
    let lookup =
        tokio::spawn(async move { get_json(state, "/agents/slow-agent?wait_ms=3000").await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let publisher = MessagePublisher::spawn(
        Arc::clone(&fixture.log) as Arc<dyn PartitionedLog>,
        PublisherConfig {
            topic: TOPIC.to_string(),
            capacity: 4,
            policy: BackpressurePolicy::Block,
        },
    );
    publisher
        .register_agent("slow-agent", "t", vec![])
        .await
        .unwrap();
    publisher.close().await;

    let (status, body) = lookup.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agent_id"], "slow-agent");

    fixture.stop().await;
}

#[tokio::test]
async fn test_get_missing_agent_is_not_found() {
    let fixture = start_fixture(1).await;

    let (status, body) = get_json(fixture.state.clone(), "/agents/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    // Bounded wait with the agent still missing: defined "not yet
    // available" result, not a hang.
    let (status, _) = get_json(fixture.state.clone(), "/agents/ghost?wait_ms=50").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    fixture.stop().await;
}

#[tokio::test]
async fn test_status_reflects_consumer_progress() {
    let fixture = start_fixture(1).await;

    let (status, body) = get_json(fixture.state.clone(), "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agents"], 0);
    assert!(body["consumer"].is_null());

    let publisher = MessagePublisher::spawn(
        Arc::clone(&fixture.log) as Arc<dyn PartitionedLog>,
        PublisherConfig {
            topic: TOPIC.to_string(),
            capacity: 4,
            policy: BackpressurePolicy::Block,
        },
    );
    publisher.register_agent("a1", "t", vec![]).await.unwrap();
    publisher.close().await;

    fixture
        .registry
        .wait_for("a1", Duration::from_secs(5))
        .await
        .expect("agent registered");

    let (status, body) = get_json(fixture.state.clone(), "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agents"], 1);
    assert_eq!(body["consumer"]["last_message_type"], "agent.register");

    fixture.stop().await;
}
