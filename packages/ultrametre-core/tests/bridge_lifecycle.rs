use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use ultrametre_core::serial::fake::FakeDevice;
use ultrametre_core::{
    AccountChange, Bridge, BridgeConfig, BridgeError, BridgePhase, BroadcastEvent, DeviceCommand,
    LedgerWatch, ManualLedgerWatch, ReplyPolicy, Subscription, WatchHandle,
};

fn config() -> BridgeConfig {
    BridgeConfig {
        serial_path: "/dev/ttyFAKE0".to_string(),
        baud_rate: 9600,
        settle_delay: Duration::ZERO,
        reply: ReplyPolicy {
            per_attempt_timeout: Duration::from_millis(100),
            max_attempts: 3,
            inter_attempt_delay: Duration::from_millis(40),
        },
    }
}

fn bridge(device: &FakeDevice) -> Arc<Bridge> {
    Arc::new(Bridge::new(config(), Arc::new(device.opener())))
}

fn bridge_with_watch(device: &FakeDevice, watch: &ManualLedgerWatch) -> Arc<Bridge> {
    Arc::new(
        Bridge::new(config(), Arc::new(device.opener()))
            .with_ledger_watch(Arc::new(watch.clone())),
    )
}

/// A watch whose teardown takes `delay` after cancellation.
struct SlowWatch {
    delay: Duration,
}

impl LedgerWatch for SlowWatch {
    fn subscribe(&self, _changes: mpsc::Sender<AccountChange>) -> Result<WatchHandle, BridgeError> {
        let (cancel, cancelled) = oneshot::channel();
        let delay = self.delay;
        let task = tokio::spawn(async move {
            let _ = cancelled.await;
            tokio::time::sleep(delay).await;
            Ok(())
        });
        Ok(WatchHandle::new(cancel, task))
    }
}

async fn wait_for_phase(bridge: &Bridge, target: BridgePhase) {
    let mut phases = bridge.watch_phase();
    tokio::time::timeout(Duration::from_secs(2), phases.wait_for(|phase| *phase == target))
        .await
        .expect("phase within 2s")
        .expect("bridge alive");
}

async fn next_event(subscription: &mut Subscription) -> BroadcastEvent {
    tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("event within 2s")
        .expect("hub alive")
}

#[tokio::test]
async fn test_repeated_start_opens_once() {
    let device = FakeDevice::new();
    let bridge = bridge(&device);

    for _ in 0..3 {
        bridge.start().await.unwrap();
        assert_eq!(bridge.phase(), BridgePhase::Running);
    }
    assert_eq!(device.open_count(), 1);

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_when_stopped_is_noop() {
    let device = FakeDevice::new();
    let bridge = bridge(&device);
    let mut events = bridge.hub().subscribe();

    bridge.stop().await.unwrap();

    assert_eq!(bridge.phase(), BridgePhase::Stopped);
    assert_eq!(events.try_recv(), None);
}

#[tokio::test]
async fn test_start_stop_broadcasts_status() {
    let device = FakeDevice::new();
    let bridge = bridge(&device);
    let mut events = bridge.hub().subscribe();

    bridge.start().await.unwrap();
    bridge.stop().await.unwrap();

    assert_eq!(next_event(&mut events).await, BroadcastEvent::Status { running: true });
    assert_eq!(next_event(&mut events).await, BroadcastEvent::Status { running: false });

    // Restart opens the port again
    bridge.start().await.unwrap();
    assert_eq!(device.open_count(), 2);
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_open_failure_stays_stopped() {
    let device = FakeDevice::new();
    device.fail_next_open("Access denied");
    let bridge = bridge(&device);
    let mut events = bridge.hub().subscribe();

    match bridge.start().await {
        Err(BridgeError::Open { address, reason }) => {
            assert_eq!(address, "/dev/ttyFAKE0");
            assert_eq!(reason, "Access denied");
        }
        other => panic!("Expected Open error, got {:?}", other),
    }
    assert_eq!(bridge.phase(), BridgePhase::Stopped);
    assert_eq!(events.try_recv(), None);

    // Not retried automatically, but a later start can succeed
    bridge.start().await.unwrap();
    assert!(bridge.is_running());
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_fetch_summary_first_attempt() {
    let device = FakeDevice::new();
    device.reply_to(b"D\n", "TOTAL_DISTANCE_TRAVELLED: 123\n");
    let bridge = bridge(&device);
    bridge.start().await.unwrap();

    let reply = bridge.fetch_telemetry_summary().await.unwrap();

    assert_eq!(reply.value, "123");
    assert_eq!(reply.attempts, 1);
    assert_eq!(device.count_written(b"D\n"), 1);
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_fetch_summary_reply_also_forwarded_as_serial() {
    let device = FakeDevice::new();
    device.reply_to(b"D\n", "TOTAL_DISTANCE_TRAVELLED: 5.5\n");
    let bridge = bridge(&device);
    let mut events = bridge.hub().subscribe();
    bridge.start().await.unwrap();
    assert_eq!(next_event(&mut events).await, BroadcastEvent::Status { running: true });

    bridge.fetch_telemetry_summary().await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        BroadcastEvent::Serial {
            text: "TOTAL_DISTANCE_TRAVELLED: 5.5".to_string()
        }
    );
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_fetch_summary_no_response() {
    let device = FakeDevice::new();
    let bridge = bridge(&device);
    bridge.start().await.unwrap();

    let started = Instant::now();
    let result = bridge.fetch_telemetry_summary().await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(BridgeError::NoResponse { attempts: 3 }));
    assert_eq!(device.count_written(b"D\n"), 3);
    // 3 * 100ms + 2 * 40ms = 380ms
    assert!(elapsed >= Duration::from_millis(370), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "elapsed {:?}", elapsed);
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_actions_need_open_port() {
    let device = FakeDevice::new();
    let bridge = bridge(&device);

    assert_eq!(
        bridge.trigger_action(DeviceCommand::Trigger).await,
        Err(BridgeError::PortClosed)
    );
    assert_eq!(bridge.clear_device_state().await, Err(BridgeError::PortClosed));
    assert_eq!(
        bridge.fetch_telemetry_summary().await,
        Err(BridgeError::PortClosed)
    );
    assert!(device.written().is_empty());
}

#[tokio::test]
async fn test_trigger_and_clear_write_commands() {
    let device = FakeDevice::new();
    let bridge = bridge(&device);
    bridge.start().await.unwrap();

    bridge.trigger_action(DeviceCommand::Trigger).await.unwrap();
    bridge.clear_device_state().await.unwrap();

    assert_eq!(device.written(), vec![b"F\n".to_vec(), b"C\n".to_vec()]);

    bridge.stop().await.unwrap();
    assert_eq!(
        bridge.trigger_action(DeviceCommand::Trigger).await,
        Err(BridgeError::PortClosed)
    );
}

#[tokio::test]
async fn test_ledger_change_triggers_device() {
    let device = FakeDevice::new();
    let watch = ManualLedgerWatch::new();
    let bridge = bridge_with_watch(&device, &watch);
    let mut events = bridge.hub().subscribe();

    bridge.start().await.unwrap();
    assert_eq!(next_event(&mut events).await, BroadcastEvent::Status { running: true });
    assert!(watch.is_subscribed());

    assert!(watch.notify(Some(42)));

    assert_eq!(
        next_event(&mut events).await,
        BroadcastEvent::Sent {
            command: "F".to_string(),
            source: "ledger".to_string()
        }
    );
    assert_eq!(device.count_written(b"F\n"), 1);
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_unsubscribes_watch_once() {
    let device = FakeDevice::new();
    let watch = ManualLedgerWatch::new();
    let bridge = bridge_with_watch(&device, &watch);

    bridge.start().await.unwrap();
    bridge.stop().await.unwrap();
    bridge.stop().await.unwrap();

    assert_eq!(watch.subscribe_count(), 1);
    assert_eq!(watch.unsubscribe_count(), 1);
    assert!(!watch.notify(Some(1)));
    assert_eq!(device.count_written(b"F\n"), 0);
}

#[tokio::test]
async fn test_watch_failure_does_not_block_start() {
    let device = FakeDevice::new();
    let watch = ManualLedgerWatch::new();
    watch.fail_next_subscribe("endpoint unreachable");
    let bridge = bridge_with_watch(&device, &watch);

    bridge.start().await.unwrap();

    assert!(bridge.is_running());
    assert!(!watch.is_subscribed());
    bridge.stop().await.unwrap();
    assert_eq!(watch.unsubscribe_count(), 0);
}

#[tokio::test]
async fn test_device_unplugged_stops_bridge() {
    let device = FakeDevice::new();
    let watch = ManualLedgerWatch::new();
    let bridge = bridge_with_watch(&device, &watch);
    let mut events = bridge.hub().subscribe();
    let mut phases = bridge.watch_phase();

    bridge.start().await.unwrap();
    assert_eq!(next_event(&mut events).await, BroadcastEvent::Status { running: true });

    device.disconnect();

    assert_eq!(next_event(&mut events).await, BroadcastEvent::Status { running: false });
    tokio::time::timeout(
        Duration::from_secs(2),
        phases.wait_for(|phase| *phase == BridgePhase::Stopped),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(watch.unsubscribe_count(), 1);
    assert_eq!(
        bridge.clear_device_state().await,
        Err(BridgeError::PortClosed)
    );

    // Stop after an unexpected close is a no-op
    bridge.stop().await.unwrap();
    assert_eq!(events.try_recv(), None);
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_events() {
    let device = FakeDevice::new();
    let bridge = bridge(&device);
    bridge.start().await.unwrap();

    let mut late = bridge.hub().subscribe();
    device.emit("MODE: ready\n");

    assert_eq!(
        next_event(&mut late).await,
        BroadcastEvent::Serial {
            text: "MODE: ready".to_string()
        }
    );
    bridge.stop().await.unwrap();
    assert_eq!(next_event(&mut late).await, BroadcastEvent::Status { running: false });
}

#[tokio::test]
async fn test_abandoned_stop_still_closes_port() {
    let device = FakeDevice::new();
    let bridge = Arc::new(
        Bridge::new(config(), Arc::new(device.opener())).with_ledger_watch(Arc::new(SlowWatch {
            delay: Duration::from_millis(300),
        })),
    );
    bridge.start().await.unwrap();
    let mut events = bridge.hub().subscribe();

    // Caller gives up while the watch is still tearing down
    assert!(tokio::time::timeout(Duration::from_millis(50), bridge.stop())
        .await
        .is_err());

    wait_for_phase(&bridge, BridgePhase::Stopped).await;
    assert_eq!(next_event(&mut events).await, BroadcastEvent::Status { running: false });
    assert!(!device.emit("MODE: still flowing\n"));
    assert_eq!(
        bridge.trigger_action(DeviceCommand::Trigger).await,
        Err(BridgeError::PortClosed)
    );
    assert_eq!(events.try_recv(), None);

    bridge.start().await.unwrap();
    assert_eq!(device.open_count(), 2);
    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_start_still_settles() {
    let device = FakeDevice::new();
    let bridge = Arc::new(Bridge::new(
        BridgeConfig {
            settle_delay: Duration::from_millis(300),
            ..config()
        },
        Arc::new(device.opener()),
    ));

    // Caller gives up during the settle delay
    assert!(tokio::time::timeout(Duration::from_millis(50), bridge.start())
        .await
        .is_err());
    assert_eq!(bridge.phase(), BridgePhase::Starting);

    wait_for_phase(&bridge, BridgePhase::Running).await;
    assert!(bridge.trigger_action(DeviceCommand::Trigger).await.is_ok());

    bridge.stop().await.unwrap();
    assert_eq!(bridge.phase(), BridgePhase::Stopped);
    assert_eq!(device.open_count(), 1);
    assert_eq!(device.written(), vec![b"F\n".to_vec()]);
}
