//! Registry + dispatcher wired together against loopback devices

use parking_lot::Mutex;
use parking_relay::domain::facility::{FacilityInfo, FacilityTable};
use parking_relay::domain::message::{PayStationEvent, PayStationType};
use parking_relay::infra::{FramingMode, Metrics};
use parking_relay::io::{
    ConnectionContext, ConnectionRegistry, ConnectionState, InboundDispatcher, PayStationForwarder,
    RegistryConfig, UiEvent, UiNotifier,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<UiEvent>>,
}

impl UiNotifier for RecordingNotifier {
    fn notify(&self, event: UiEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Default)]
struct RecordingForwarder {
    forwarded: Mutex<Vec<(PayStationType, String, Option<String>)>>,
}

impl PayStationForwarder for RecordingForwarder {
    fn forward(&self, conn: &ConnectionContext, event: &PayStationEvent, facility: Option<&FacilityInfo>) {
        self.forwarded.lock().push((
            event.kind.clone(),
            conn.remote_addr.to_string(),
            facility.map(|f| f.facilities_id.clone()),
        ));
    }
}

struct Relay {
    registry: Arc<ConnectionRegistry>,
    notifier: Arc<RecordingNotifier>,
    forwarder: Arc<RecordingForwarder>,
    metrics: Arc<Metrics>,
}

fn relay(facilities: Vec<FacilityInfo>, framing: FramingMode) -> Relay {
    let metrics = Arc::new(Metrics::new());
    let table = Arc::new(FacilityTable::new(facilities));
    let notifier = Arc::new(RecordingNotifier::default());
    let forwarder = Arc::new(RecordingForwarder::default());

    let config = RegistryConfig {
        reconnect_delay: Duration::from_millis(100),
        dial_timeout: Duration::from_millis(500),
        framing,
        ..Default::default()
    };
    let registry = ConnectionRegistry::with_handler(config, table, metrics.clone(), |resolver| {
        Arc::new(
            InboundDispatcher::new(resolver, notifier.clone(), metrics.clone())
                .with_forwarder(forwarder.clone()),
        )
    });
    registry.configure(2).unwrap();

    Relay { registry, notifier, forwarder, metrics }
}

fn facility(id: &str, port: u16) -> FacilityInfo {
    FacilityInfo {
        facilities_id: id.to_string(),
        dt_facilities_id: format!("DT-{id}"),
        fname: String::new(),
        category: "PAYSTATION".to_string(),
        ip: "127.0.0.1".to_string(),
        port,
        gate_id: None,
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_payment_from_unconfigured_device_resolves_to_none() {
    let listener = TcpListener::bind("127.0.0.1:7979").await.unwrap();
    let relay = relay(Vec::new(), FramingMode::Delimited);

    let state = relay.registry.connect("127.0.0.1", 7979).await.unwrap();
    assert_eq!(state, ConnectionState::Connected);

    let (mut device, _) = listener.accept().await.unwrap();
    device.write_all(b"payment|{\"type\":\"payment\"}\n").await.unwrap();

    assert!(wait_until(|| !relay.forwarder.forwarded.lock().is_empty()).await);
    let forwarded = relay.forwarder.forwarded.lock().clone();
    assert_eq!(
        forwarded,
        vec![(PayStationType::Payment, "127.0.0.1:7979".to_string(), None)]
    );
    assert_eq!(relay.metrics.totals().facility_misses, 1);

    relay.registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_routed_by_category() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = relay(vec![facility("PAY-01", port)], FramingMode::Delimited);

    relay.registry.connect("127.0.0.1", port).await.unwrap();
    let (mut device, _) = listener.accept().await.unwrap();

    device
        .write_all(
            b"GATE#1\r\n{\"type\":\"healthCheck\"}\nnot json\n{\"type\":\"vehicleListSearch\",\"vehicleNo\":\"3456\"}\n",
        )
        .await
        .unwrap();

    assert!(wait_until(|| relay.metrics.frames_total() == 4).await);
    assert!(wait_until(|| relay.forwarder.forwarded.lock().len() == 1).await);

    let forwarded = relay.forwarder.forwarded.lock().clone();
    assert_eq!(forwarded[0].0, PayStationType::VehicleListSearch);
    assert_eq!(forwarded[0].2.as_deref(), Some("PAY-01"));

    let totals = relay.metrics.totals();
    assert_eq!(totals.breaker_frames, 1);
    assert_eq!(totals.decode_failures, 1);
    // healthCheck never triggers a lookup
    assert_eq!(totals.facility_lookups, 1);

    relay.registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ui_events_follow_session_lifecycle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = relay(Vec::new(), FramingMode::Delimited);

    relay.registry.connect("127.0.0.1", port).await.unwrap();
    let (device, _) = listener.accept().await.unwrap();
    assert!(wait_until(|| relay.notifier.events.lock().len() == 1).await);

    drop(device);
    // Disconnect, then the reconnect brings the session back
    let (_device, _) = listener.accept().await.unwrap();
    assert!(wait_until(|| relay.notifier.events.lock().len() == 3).await);

    let events = relay.notifier.events.lock().clone();
    assert_eq!(events, vec![UiEvent::Connect, UiEvent::Disconnect, UiEvent::Connect]);
    assert_eq!(relay.metrics.reconnect_attempts_total(), 1);

    relay.registry.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_reaches_device_and_raw_framing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = relay(vec![facility("PAY-02", port)], FramingMode::Raw);

    relay.registry.connect("127.0.0.1", port).await.unwrap();
    let (mut device, _) = listener.accept().await.unwrap();

    assert!(relay.registry.send("127.0.0.1", "OPEN"));
    let mut buf = [0u8; 4];
    device.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"OPEN");

    // Raw framing: no delimiter needed
    device.write_all(b"{\"type\":\"adjustmentRequest\"}").await.unwrap();
    assert!(wait_until(|| relay.forwarder.forwarded.lock().len() == 1).await);
    let forwarded = relay.forwarder.forwarded.lock().clone();
    assert_eq!(forwarded[0].0, PayStationType::AdjustmentRequest);
    assert_eq!(forwarded[0].2.as_deref(), Some("PAY-02"));

    relay.registry.shutdown();
}
