//! End-to-end handshake tests: in-process bus → bridge → simulated controller
//! → bridge → bus.
//!
//! The reader thread publishes through the runtime handle, so every test runs
//! on the multi-threaded runtime.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use kiosk_hal::SimSerial;
use kiosk_middleware::{
    BridgeConfig, BusClient, BusHandler, HandshakeBridge, LocalBus, ReaderHandle,
    TopicSubscriber,
};
use kiosk_types::{BusMessage, HandshakeState, KioskError, QoS};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const READY: &str = "kiosk/pickup/box_delivered";
const ALL_DONE: &str = "kiosk/pickup/all_done";

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

struct Harness {
    serial: SimSerial,
    bus: LocalBus,
    bridge: HandshakeBridge,
    done: TopicSubscriber,
    reader: ReaderHandle,
    stop_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

impl Harness {
    async fn start(cfg: BridgeConfig) -> Self {
        let serial = SimSerial::new(Duration::from_millis(20));
        let bus = LocalBus::default();
        let bridge =
            HandshakeBridge::new(cfg, Arc::new(serial.clone()), Arc::new(bus.clone())).unwrap();
        let done = bus.subscribe_topic(bridge.config().completion_topic.clone());

        let reader = bridge.start(Handle::current()).unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = {
            let bus = bus.clone();
            let handler: Arc<dyn BusHandler> = Arc::new(bridge.clone());
            tokio::spawn(async move { bus.run(handler, stop_rx).await })
        };
        assert!(
            wait_until(|| bus.subscriptions().iter().any(|s| s == READY)).await,
            "bridge never subscribed"
        );

        Self {
            serial,
            bus,
            bridge,
            done,
            reader,
            stop_tx,
            dispatcher,
        }
    }

    fn ready(&self) {
        self.bus
            .publish_message(BusMessage::new(READY, r#"{"box":7}"#, QoS::AtLeastOnce))
            .unwrap();
    }

    async fn expect_completion(&mut self) -> BusMessage {
        tokio::time::timeout(Duration::from_secs(2), self.done.recv())
            .await
            .expect("completion must be published")
            .expect("bus closed")
    }

    /// Give the reader several read intervals, then assert nothing was
    /// published.
    async fn expect_no_completion(&mut self) {
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(self.done.try_recv().is_none(), "unexpected completion published");
    }

    async fn shutdown(self) -> Result<(), KioskError> {
        self.bridge.stop();
        let reader = self.reader;
        let outcome = tokio::task::spawn_blocking(move || reader.join())
            .await
            .unwrap();
        self.stop_tx.send(true).unwrap();
        self.dispatcher.await.unwrap();
        outcome
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ready_command_ack_completion() {
    let mut h = Harness::start(BridgeConfig::default()).await;

    h.ready();
    assert!(wait_until(|| h.bridge.is_armed()).await);
    assert_eq!(h.serial.written(), vec![b"o\n".to_vec()]);

    h.serial.push_chunk(b"done\r\n");
    let msg = h.expect_completion().await;
    assert_eq!(msg.topic, ALL_DONE);
    assert_eq!(msg.payload, b"success");
    assert_eq!(msg.qos, QoS::AtLeastOnce);

    assert!(wait_until(|| h.bridge.state() == HandshakeState::Idle).await);
    h.expect_no_completion().await;
    h.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn back_to_back_ready_events_complete_once() {
    let mut h = Harness::start(BridgeConfig::default()).await;

    h.ready();
    h.ready();
    assert!(wait_until(|| h.serial.written().len() == 2).await);
    assert!(h.serial.written().iter().all(|w| w == b"o\n"));
    assert!(h.bridge.is_armed());

    h.serial.push_chunk(b"done");
    h.expect_completion().await;
    h.expect_no_completion().await;
    assert!(!h.bridge.is_armed());
    h.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_completion_per_cycle() {
    let mut h = Harness::start(BridgeConfig::default()).await;

    for token in ["DONE\r\n", "Done", "done"] {
        h.ready();
        assert!(wait_until(|| h.bridge.is_armed()).await);
        h.serial.push_chunk(token);
        let msg = h.expect_completion().await;
        assert_eq!(msg.payload, b"success", "token {token:?}");
        assert!(wait_until(|| !h.bridge.is_armed()).await);
    }

    h.expect_no_completion().await;
    assert_eq!(h.serial.written().len(), 3);
    h.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ack_while_idle_has_no_effect() {
    let mut h = Harness::start(BridgeConfig::default()).await;

    h.serial.push_chunk(b"done");
    assert!(wait_until(|| h.serial.drained()).await);
    h.expect_no_completion().await;
    assert_eq!(h.bridge.state(), HandshakeState::Idle);

    // A stale ack must not complete a later cycle either.
    h.ready();
    assert!(wait_until(|| h.bridge.is_armed()).await);
    h.expect_no_completion().await;

    h.serial.push_chunk(b"done");
    h.expect_completion().await;
    h.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_ack_means_no_completion() {
    let mut h = Harness::start(BridgeConfig::default()).await;

    h.ready();
    assert!(wait_until(|| h.bridge.is_armed()).await);
    h.serial.push_chunk(b"door open\r\n");
    h.serial.push_chunk(b"busy");
    assert!(wait_until(|| h.serial.drained()).await);

    h.expect_no_completion().await;
    assert!(h.bridge.is_armed());
    h.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_failure_does_not_wedge_the_bridge() {
    let mut h = Harness::start(BridgeConfig::default()).await;
    h.serial.fail_next_writes(1);

    h.ready();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.serial.written().is_empty());
    assert!(!h.bridge.is_armed());

    h.ready();
    assert!(wait_until(|| h.bridge.is_armed()).await);
    h.serial.push_chunk(b"done");
    h.expect_completion().await;
    h.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_split_across_reads() {
    let mut h = Harness::start(BridgeConfig::default()).await;

    h.ready();
    assert!(wait_until(|| h.bridge.is_armed()).await);
    h.serial.push_chunk(b"box do");
    assert!(wait_until(|| h.serial.drained()).await);
    h.serial.push_chunk(b"NE\r\n");

    h.expect_completion().await;
    h.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_split_across_reads_is_missed_in_per_chunk_mode() {
    let cfg = BridgeConfig {
        ack_across_reads: false,
        ..BridgeConfig::default()
    };
    let mut h = Harness::start(cfg).await;

    h.ready();
    assert!(wait_until(|| h.bridge.is_armed()).await);
    h.serial.push_chunk(b"box do");
    assert!(wait_until(|| h.serial.drained()).await);
    h.serial.push_chunk(b"ne\r\n");
    assert!(wait_until(|| h.serial.drained()).await);

    h.expect_no_completion().await;
    assert!(h.bridge.is_armed());
    h.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_completion_publish_still_disarms() {
    let mut h = Harness::start(BridgeConfig::default()).await;

    h.ready();
    assert!(wait_until(|| h.bridge.is_armed()).await);

    h.bus.disconnect();
    h.serial.push_chunk(b"done");
    assert!(wait_until(|| !h.bridge.is_armed()).await);

    h.bus.reconnect();
    assert!(wait_until(|| h.bus.subscriptions().iter().any(|s| s == READY)).await);
    h.expect_no_completion().await;

    h.ready();
    assert!(wait_until(|| h.bridge.is_armed()).await);
    h.serial.push_chunk(b"done");
    h.expect_completion().await;
    h.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resubscribes_after_reconnect() {
    let h = Harness::start(BridgeConfig::default()).await;
    let connects = h.bus.connection().connect_count();

    h.bus.disconnect();
    assert!(h.bus.subscriptions().is_empty());
    h.bus.reconnect();

    assert!(wait_until(|| h.bus.subscriptions().iter().any(|s| s == READY)).await);
    assert_eq!(h.bus.connection().connect_count(), connects + 1);

    h.ready();
    assert!(wait_until(|| h.bridge.is_armed()).await);
    h.shutdown().await.unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader lifecycle
// ─────────────────────────────────────────────────────────────────────────────

fn bare_bridge(read_timeout: Duration) -> (SimSerial, LocalBus, HandshakeBridge) {
    let serial = SimSerial::new(read_timeout);
    let bus = LocalBus::default();
    let bridge = HandshakeBridge::new(
        BridgeConfig::default(),
        Arc::new(serial.clone()),
        Arc::new(bus.clone()),
    )
    .unwrap();
    (serial, bus, bridge)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_empty_read_exits_within_one_interval() {
    let interval = Duration::from_millis(100);
    let (serial, _bus, bridge) = bare_bridge(interval);

    let reader = bridge.start(Handle::current()).unwrap();
    assert!(wait_until(|| serial.reads() >= 1).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let stopped_at = Instant::now();
    let reads_at_stop = serial.reads();
    bridge.stop();

    tokio::task::spawn_blocking(move || reader.join())
        .await
        .unwrap()
        .unwrap();
    assert!(stopped_at.elapsed() < interval + Duration::from_millis(50));
    assert_eq!(serial.reads(), reads_at_stop, "reader kept reading after stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_leaves_armed_flag_untouched() {
    let (_serial, _bus, bridge) = bare_bridge(Duration::from_millis(10));
    let reader = bridge.start(Handle::current()).unwrap();

    bridge.on_ready_event(READY, b"").unwrap();
    reader.stop();
    tokio::task::spawn_blocking(move || reader.join())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(bridge.state(), HandshakeState::Armed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_failure_is_fatal_and_reported() {
    let (serial, bus, bridge) = bare_bridge(Duration::from_millis(10));
    let mut done = bus.subscribe_topic(ALL_DONE);

    let reader = bridge.start(Handle::current()).unwrap();
    serial.push_read_error("device disconnected");
    assert!(wait_until(|| reader.is_finished()).await);

    let err = tokio::task::spawn_blocking(move || reader.join())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, KioskError::SerialRead(ref m) if m.contains("device disconnected")));
    assert!(err.is_fatal());

    // Nothing reads after the failure, so a later ack goes unanswered.
    bridge.on_ready_event(READY, b"").unwrap();
    serial.push_chunk(b"done");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(done.try_recv().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_before_start_is_honoured() {
    let (serial, _bus, bridge) = bare_bridge(Duration::from_millis(50));

    bridge.stop();
    let reader = bridge.start(Handle::current()).unwrap();
    tokio::task::spawn_blocking(move || reader.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(serial.reads(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Re-arming while a completion is being published
// ─────────────────────────────────────────────────────────────────────────────

/// Bus client whose publishes take `delay` before reaching the inner bus.
struct SlowBus {
    inner: LocalBus,
    delay: Duration,
    started: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl BusClient for SlowBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), KioskError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let res = self.inner.publish(topic, payload, qos).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        res
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), KioskError> {
        self.inner.subscribe(filter, qos).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ready_during_inflight_publish_starts_a_new_cycle() {
    let serial = SimSerial::new(Duration::from_millis(10));
    let local = LocalBus::default();
    let mut done = local.subscribe_topic(ALL_DONE);
    let bus = Arc::new(SlowBus {
        inner: local,
        delay: Duration::from_millis(300),
        started: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
    });
    let bridge = HandshakeBridge::new(
        BridgeConfig::default(),
        Arc::new(serial.clone()),
        Arc::clone(&bus) as Arc<dyn BusClient>,
    )
    .unwrap();
    let reader = bridge.start(Handle::current()).unwrap();

    bridge.on_ready_event(READY, b"").unwrap();
    serial.push_chunk(b"done");
    assert!(wait_until(|| bus.started.load(Ordering::SeqCst) == 1).await);
    assert!(!bridge.is_armed(), "acknowledgment is consumed before the publish");

    // Second delivery while the first completion is still in flight.
    bridge.on_ready_event(READY, b"").unwrap();
    assert!(bridge.is_armed());

    assert!(wait_until(|| bus.finished.load(Ordering::SeqCst) == 1).await);
    assert!(bridge.is_armed(), "finishing the first publish must not disarm the second cycle");

    serial.push_chunk(b"done");
    assert!(wait_until(|| bus.finished.load(Ordering::SeqCst) == 2).await);
    assert!(!bridge.is_armed());

    for _ in 0..2 {
        let msg = tokio::time::timeout(Duration::from_secs(1), done.recv())
            .await
            .expect("completion must be published")
            .expect("bus closed");
        assert_eq!(msg.payload, b"success");
    }
    assert!(done.try_recv().is_none());

    bridge.stop();
    tokio::task::spawn_blocking(move || reader.join())
        .await
        .unwrap()
        .unwrap();
}
