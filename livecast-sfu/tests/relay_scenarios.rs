//! End-to-end relay scenarios driven through the public API

use futures::future::join_all;
use livecast_sfu::engine::DtlsState;
use livecast_sfu::{
    ConnectionId, DtlsFingerprint, DtlsParameters, DtlsRole, FatalHandler, LocalEngine, MediaKind,
    ProducerId, RtcpParameters, RtpCodecParameters, RtpEncodingParameters, RtpParameters,
    SfuConfig, SfuError, SfuManager, SignalingHandler, Supervisor, TransportRole,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: LocalEngine,
    supervisor: Supervisor,
    fatal: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn with(config: SfuConfig, latency: Duration) -> Self {
        let (engine, events) = LocalEngine::with_latency(latency);
        let fatal = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fatal);
        let handler: FatalHandler = Arc::new(move |reason: &str| sink.lock().push(reason.to_string()));
        let supervisor = Supervisor::initialize(config, Arc::new(engine.clone()), events, handler)
            .expect("supervisor starts");
        Self {
            engine,
            supervisor,
            fatal,
        }
    }

    fn new() -> Self {
        Self::with(SfuConfig::default(), Duration::ZERO)
    }

    fn relay(&self) -> &Arc<SfuManager> {
        self.supervisor.relay()
    }

    async fn publish(&self, name: &str) -> (ConnectionId, ProducerId) {
        let conn = ConnectionId::from(name);
        let relay = self.relay();
        relay.create_transport(&conn, TransportRole::Producing).await.unwrap();
        relay
            .connect_transport(&conn, TransportRole::Producing, dtls())
            .await
            .unwrap();
        let producer = relay
            .produce(&conn, MediaKind::Audio, opus_parameters())
            .await
            .unwrap();
        (conn, producer)
    }

    async fn subscribe(&self, name: &str) -> ConnectionId {
        let conn = ConnectionId::from(name);
        let relay = self.relay();
        relay.create_transport(&conn, TransportRole::Consuming).await.unwrap();
        relay
            .connect_transport(&conn, TransportRole::Consuming, dtls())
            .await
            .unwrap();
        conn
    }
}

fn dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "12:34:56:78:9A:BC".to_string(),
        }],
    }
}

fn opus_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 100,
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![],
        }],
        header_extensions: vec![],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(4242),
            ..Default::default()
        }],
        rtcp: RtcpParameters {
            cname: Some("x".to_string()),
            reduced_size: true,
        },
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

async fn call(signaling: &SignalingHandler, conn: &ConnectionId, id: u64, method: &str, data: Value) -> Value {
    let text = json!({ "id": id, "method": method, "data": data }).to_string();
    let response: Value = serde_json::from_str(&signaling.handle_text(conn, &text).await).unwrap();
    assert_eq!(response["id"], id);
    response["response"].clone()
}

#[tokio::test]
async fn test_publish_subscribe_resume_over_signaling() {
    let harness = Harness::new();
    let signaling = SignalingHandler::new(Arc::clone(harness.relay()));
    let x = ConnectionId::from("x");
    let y = ConnectionId::from("y");

    call(&signaling, &x, 1, "createTransport", json!({ "isProducer": true })).await;
    let ok = call(&signaling, &x, 2, "connectProducerTransport", json!({ "dtlsParameters": dtls() })).await;
    assert_eq!(ok, json!({ "success": true }));
    let produced = call(
        &signaling,
        &x,
        3,
        "produce",
        json!({ "kind": "audio", "rtpParameters": opus_parameters() }),
    )
    .await;
    let producer_id = produced["id"].as_str().unwrap().to_string();
    assert!(!producer_id.is_empty());

    let caps = call(&signaling, &y, 1, "getCapabilities", Value::Null).await;
    call(&signaling, &y, 2, "createTransport", json!({ "isProducer": false })).await;
    call(&signaling, &y, 3, "connectConsumerTransport", json!({ "dtlsParameters": dtls() })).await;
    let consumed = call(
        &signaling,
        &y,
        4,
        "consume",
        json!({ "producerId": producer_id, "rtpCapabilities": caps }),
    )
    .await;
    assert_eq!(consumed["producerId"], producer_id.as_str());
    assert_eq!(consumed["kind"], "audio");
    // Payload type follows the subscriber's capabilities
    assert_eq!(consumed["rtpParameters"]["codecs"][0]["payloadType"], 96);

    let resumed = call(&signaling, &y, 5, "resume", json!({ "consumerId": consumed["id"] })).await;
    assert_eq!(resumed, json!({ "success": true }));
}

#[tokio::test]
async fn test_publisher_disconnect_closes_remote_consumer() {
    let harness = Harness::new();
    let relay = harness.relay();
    let (x, producer) = harness.publish("x").await;
    let y = harness.subscribe("y").await;
    let caps = relay.capabilities().rtp_capabilities().clone();
    let consumer = relay.consume(&y, &producer, &caps).await.unwrap();

    relay.destroy_session(&x);

    assert_eq!(relay.consumer_state(&y, &consumer.id), None);
    assert_eq!(
        relay.resume(&y, &consumer.id).await.unwrap_err(),
        SfuError::ConsumerNotFound
    );
    // Subscriber's own transport survives
    assert!(relay.transport_state(&y, TransportRole::Consuming).is_some());
}

#[tokio::test]
async fn test_consume_unknown_producer_creates_nothing() {
    let harness = Harness::new();
    let relay = harness.relay();
    let y = harness.subscribe("y").await;
    let caps = relay.capabilities().rtp_capabilities().clone();

    let err = relay
        .consume(&y, &ProducerId::from("never"), &caps)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "producer not found");
    assert_eq!(relay.stats().consumers, 0);
    assert!(relay.session(&y).unwrap().consumers.is_empty());
}

#[tokio::test]
async fn test_second_producing_transport_replaces_first() {
    let harness = Harness::new();
    let relay = harness.relay();
    let (x, producer) = harness.publish("x").await;
    let first = relay.session(&x).unwrap().producing_transport.unwrap();

    let second = relay.create_transport(&x, TransportRole::Producing).await.unwrap();
    assert_ne!(first, second.id);

    assert!(!relay.producer_exists(&producer));
    assert!(!harness.engine.has_producer(&producer));
    let session = relay.session(&x).unwrap();
    assert_eq!(session.producing_transport, Some(second.id));
    assert!(session.producers.is_empty());
    assert_eq!(relay.stats().transports, 1);
    assert_eq!(harness.engine.transport_count(), 1);
}

#[tokio::test]
async fn test_concurrent_consumes_before_and_after_close() {
    let harness = Harness::new();
    let relay = harness.relay();
    let (_x, producer) = harness.publish("x").await;
    let caps = relay.capabilities().rtp_capabilities().clone();

    let mut subscribers = Vec::new();
    for i in 0..8 {
        subscribers.push(harness.subscribe(&format!("sub-{i}")).await);
    }

    let results = join_all(subscribers.iter().map(|c| relay.consume(c, &producer, &caps))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(relay.stats().consumers, 8);

    let teardown = relay.close_producer(&producer);
    assert_eq!(teardown.consumers.len(), 8);

    let results = join_all(subscribers.iter().map(|c| relay.consume(c, &producer, &caps))).await;
    assert!(results
        .iter()
        .all(|r| r.as_ref().unwrap_err() == &SfuError::ProducerNotFound));
    assert_eq!(relay.stats().consumers, 0);
}

#[tokio::test]
async fn test_destroyed_session_leaves_no_records() {
    let harness = Harness::new();
    let relay = harness.relay();
    let (x, producer) = harness.publish("x").await;
    relay.create_transport(&x, TransportRole::Consuming).await.unwrap();
    let (_z, other) = harness.publish("z").await;
    let y = harness.subscribe("y").await;
    let caps = relay.capabilities().rtp_capabilities().clone();

    relay.consume(&x, &other, &caps).await.unwrap();
    relay.consume(&y, &producer, &caps).await.unwrap();
    relay.consume(&y, &other, &caps).await.unwrap();

    let teardown = relay.destroy_session(&x);
    assert_eq!(teardown.transports.len(), 2);
    assert_eq!(teardown.producers, vec![producer.clone()]);
    // x's own consumer plus y's consumer of x's producer
    assert_eq!(teardown.consumers.len(), 2);

    assert!(relay.session(&x).is_none());
    assert!(!relay.producer_exists(&producer));
    let stats = relay.stats();
    assert_eq!(stats.sessions, 2);
    assert_eq!(stats.producers, 1);
    assert_eq!(stats.consumers, 1);
    assert_eq!(stats.transports, 2);
    assert_eq!(stats.ports_in_use, 2);

    assert!(relay.destroy_session(&x).is_empty());
}

#[tokio::test]
async fn test_port_exhaustion_is_retryable() {
    let config = SfuConfig {
        rtc_min_port: 40000,
        rtc_max_port: 40001,
        ..Default::default()
    };
    let harness = Harness::with(config, Duration::ZERO);
    let relay = harness.relay();

    let a = ConnectionId::from("a");
    let b = ConnectionId::from("b");
    relay.create_transport(&a, TransportRole::Producing).await.unwrap();
    relay.create_transport(&a, TransportRole::Consuming).await.unwrap();

    let err = relay
        .create_transport(&b, TransportRole::Producing)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, SfuError::PortsExhausted { .. }));

    relay.destroy_session(&a);
    let info = relay.create_transport(&b, TransportRole::Producing).await.unwrap();
    assert!((40000..=40001).contains(&info.ice_candidates[0].port));
}

#[tokio::test]
async fn test_inflight_create_after_disconnect_leaks_nothing() {
    let harness = Harness::with(SfuConfig::default(), Duration::from_millis(50));
    let relay = Arc::clone(harness.relay());
    let conn = ConnectionId::from("flaky");

    let task = {
        let relay = Arc::clone(&relay);
        let conn = conn.clone();
        tokio::spawn(async move { relay.create_transport(&conn, TransportRole::Producing).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    relay.destroy_session(&conn);

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err, SfuError::SessionClosed);
    assert!(relay.session(&conn).is_none());
    assert_eq!(relay.stats().transports, 0);
    assert_eq!(relay.stats().ports_in_use, 0);
    assert_eq!(harness.engine.transport_count(), 0);
}

#[tokio::test]
async fn test_transport_failure_cascades() {
    let harness = Harness::new();
    let relay = harness.relay();
    let (x, producer) = harness.publish("x").await;
    let y = harness.subscribe("y").await;
    let caps = relay.capabilities().rtp_capabilities().clone();
    let consumer = relay.consume(&y, &producer, &caps).await.unwrap();

    let transport = relay.session(&x).unwrap().producing_transport.unwrap();
    assert!(harness.engine.fail_transport(&transport, DtlsState::Closed));
    settle().await;

    assert!(!relay.producer_exists(&producer));
    assert_eq!(relay.consumer_state(&y, &consumer.id), None);
    assert!(relay.session(&x).unwrap().producing_transport.is_none());
    assert!(harness.fatal.lock().is_empty());

    // Protocol errors afterwards do not tear anything else down
    let err = relay
        .produce(&x, MediaKind::Audio, opus_parameters())
        .await
        .unwrap_err();
    assert_eq!(err, SfuError::TransportNotFound(TransportRole::Producing));
    assert!(relay.session(&y).is_some());
}

#[tokio::test]
async fn test_worker_death_invokes_fatal_handler() {
    let harness = Harness::new();
    harness.publish("x").await;

    harness.engine.kill("worker exited with code 42");
    settle().await;

    assert_eq!(
        *harness.fatal.lock(),
        vec!["worker exited with code 42".to_string()]
    );
    let err = harness
        .relay()
        .create_transport(&ConnectionId::from("late"), TransportRole::Producing)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
}
