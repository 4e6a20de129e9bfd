//! Bridge Lifecycle Controller
//!
//! [`Bridge`] is the one owner of the serial connection and the ledger watch.
//! Transitions are serialized behind an async mutex; the current phase is
//! published on a `watch` channel so status reads never wait on a transition
//! in progress.
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!               \______ open failed ______________/
//! ```

use crate::error::BridgeError;
use crate::hub::BroadcastHub;
use crate::ledger::{AccountChange, LedgerWatch, WatchHandle};
use crate::serial::{
    classify, ChannelEvent, LineClass, PortOpener, ReplyMatch, ReplyMatcher, ReplyPolicy,
    SerialConnection, SerialHandle,
};
use crate::sink::{LogSink, TelemetrySink};
use crate::{
    BroadcastEvent, DeviceCommand, DEFAULT_BAUD_RATE, DEFAULT_SERIAL_PATH, LEDGER_SOURCE,
    SUMMARY_PATTERN,
};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, MutexGuard, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Queue depth between the ledger watch and the relay task.
const RELAY_CAPACITY: usize = 16;

/// Configuration for a [`Bridge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Serial device path (e.g. `COM5`, `/dev/ttyUSB0`)
    pub serial_path: String,

    pub baud_rate: u32,

    /// Wait after opening before the channel accepts commands.
    /// Most boards reset when the port opens.
    pub settle_delay: Duration,

    /// Timing for reply-bearing requests
    pub reply: ReplyPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial_path: DEFAULT_SERIAL_PATH.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            settle_delay: Duration::from_millis(2000),
            reply: ReplyPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgePhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Resources that exist only while running. Guarded by the transition lock.
#[derive(Default)]
struct Inner {
    connection: Option<SerialConnection>,
    watch: Option<WatchHandle>,
    relay: Option<JoinHandle<()>>,
    /// Bumped on every successful open so a stale close notice can be told apart
    generation: u64,
}

impl Inner {
    fn holds_resources(&self) -> bool {
        self.connection.is_some() || self.watch.is_some() || self.relay.is_some()
    }
}

pub struct Bridge {
    config: BridgeConfig,
    opener: Arc<dyn PortOpener>,
    ledger: Option<Arc<dyn LedgerWatch>>,
    sink: Arc<dyn TelemetrySink>,
    hub: Arc<BroadcastHub>,
    matcher: ReplyMatcher,
    phase: watch::Sender<BridgePhase>,
    inner: Mutex<Inner>,
    /// Write handle for actions; `None` unless Running
    current: std::sync::Mutex<Option<SerialHandle>>,
}

fn summary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(SUMMARY_PATTERN).expect("valid summary pattern"))
}

impl Bridge {
    pub fn new(config: BridgeConfig, opener: Arc<dyn PortOpener>) -> Self {
        let matcher = ReplyMatcher::new(config.reply.clone());
        let (phase, _) = watch::channel(BridgePhase::Stopped);
        Self {
            config,
            opener,
            ledger: None,
            sink: Arc::new(LogSink),
            hub: Arc::new(BroadcastHub::new()),
            matcher,
            phase,
            inner: Mutex::new(Inner::default()),
            current: std::sync::Mutex::new(None),
        }
    }

    /// Arm `watch` on every start.
    pub fn with_ledger_watch(mut self, watch: Arc<dyn LedgerWatch>) -> Self {
        self.ledger = Some(watch);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn phase(&self) -> BridgePhase {
        *self.phase.borrow()
    }

    /// Observe phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<BridgePhase> {
        self.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == BridgePhase::Running
    }

    fn set_phase(&self, phase: BridgePhase) {
        self.phase.send_replace(phase);
    }

    fn current(&self) -> MutexGuard<'_, Option<SerialHandle>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the device and arm the ledger watch. A no-op if already running.
    ///
    /// On open failure the bridge stays stopped and the error is returned.
    /// A watch that fails to arm is logged; the bridge still runs without it.
    /// The transition runs on its own task and completes even if the caller
    /// is dropped.
    pub async fn start(self: &Arc<Self>) -> Result<(), BridgeError> {
        let bridge = self.clone();
        tokio::spawn(async move { bridge.run_start().await })
            .await
            .map_err(|e| BridgeError::Task(format!("start: {}", e)))?
    }

    async fn run_start(self: &Arc<Self>) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        if self.phase() == BridgePhase::Running {
            return Ok(());
        }
        if inner.holds_resources() {
            log::warn!("[bridge] Releasing resources left by an interrupted transition");
            self.teardown(&mut inner).await;
        }
        self.set_phase(BridgePhase::Starting);

        let (connection, events) = match self.open_channel().await {
            Ok(opened) => opened,
            Err(e) => {
                log::error!("[bridge] {}", e);
                self.set_phase(BridgePhase::Stopped);
                return Err(e);
            }
        };

        inner.generation += 1;
        tokio::spawn(pump_inbound(Arc::downgrade(self), events, inner.generation));
        let handle = connection.handle();
        inner.connection = Some(connection);

        if !self.config.settle_delay.is_zero() {
            log::debug!("[bridge] Waiting {:?} for device to settle", self.config.settle_delay);
            tokio::time::sleep(self.config.settle_delay).await;
        }

        if let Some(ledger) = &self.ledger {
            let (changes_tx, changes_rx) = mpsc::channel(RELAY_CAPACITY);
            match ledger.subscribe(changes_tx) {
                Ok(watch) => {
                    inner.watch = Some(watch);
                    inner.relay = Some(tokio::spawn(relay_changes(
                        handle.clone(),
                        self.hub.clone(),
                        changes_rx,
                    )));
                }
                Err(e) => log::warn!("[bridge] Running without ledger watch: {}", e),
            }
        }

        *self.current() = Some(handle);
        self.set_phase(BridgePhase::Running);
        self.hub.broadcast(BroadcastEvent::Status { running: true });
        log::info!("[bridge] Running on {}", self.config.serial_path);
        Ok(())
    }

    async fn open_channel(
        &self,
    ) -> Result<(SerialConnection, broadcast::Receiver<ChannelEvent>), BridgeError> {
        let opener = self.opener.clone();
        let path = self.config.serial_path.clone();
        let baud_rate = self.config.baud_rate;

        // Opening a real port can block for a while
        tokio::task::spawn_blocking(move || SerialConnection::open(opener.as_ref(), &path, baud_rate))
            .await
            .map_err(|e| BridgeError::open(&self.config.serial_path, e))?
    }

    /// Tear down the watch and close the device. A no-op if already stopped.
    ///
    /// Like [`start`](Self::start), runs to completion on its own task.
    pub async fn stop(self: &Arc<Self>) -> Result<(), BridgeError> {
        let bridge = self.clone();
        tokio::spawn(async move { bridge.run_stop().await })
            .await
            .map_err(|e| BridgeError::Task(format!("stop: {}", e)))
    }

    async fn run_stop(&self) {
        let mut inner = self.inner.lock().await;
        if self.phase() == BridgePhase::Stopped && !inner.holds_resources() {
            return;
        }
        self.teardown(&mut inner).await;
        log::info!("[bridge] Stopped");
    }

    async fn teardown(&self, inner: &mut Inner) {
        self.set_phase(BridgePhase::Stopping);
        self.current().take();

        // Everything leaves `inner` before the first await
        let watch = inner.watch.take();
        let relay = inner.relay.take();
        let connection = inner.connection.take();

        if let Some(relay) = relay {
            relay.abort();
        }
        if let Some(mut watch) = watch {
            if let Err(e) = watch.unsubscribe().await {
                log::warn!("[bridge] Ledger watch teardown: {}", e);
            }
        }
        if let Some(connection) = connection {
            connection.close().await;
        }

        self.set_phase(BridgePhase::Stopped);
        self.hub.broadcast(BroadcastEvent::Status { running: false });
    }

    /// The reader ended on its own (unplugged, read error).
    async fn on_channel_lost(&self, generation: u64, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || self.phase() != BridgePhase::Running {
            return;
        }
        log::warn!("[bridge] Port closed unexpectedly: {}", reason);
        self.teardown(&mut inner).await;
    }

    fn live_channel(&self) -> Result<SerialHandle, BridgeError> {
        self.current()
            .clone()
            .filter(|channel| channel.is_open())
            .ok_or(BridgeError::PortClosed)
    }

    /// Write a single fire-and-forget command.
    pub async fn trigger_action(&self, command: DeviceCommand) -> Result<(), BridgeError> {
        let channel = self.live_channel()?;
        channel.write(&command.frame()).await?;
        log::info!("[bridge] Sent {}", command.as_str());
        Ok(())
    }

    pub async fn clear_device_state(&self) -> Result<(), BridgeError> {
        self.trigger_action(DeviceCommand::Clear).await
    }

    /// Ask the device for its distance summary and wait for the reply.
    pub async fn fetch_telemetry_summary(&self) -> Result<ReplyMatch, BridgeError> {
        let channel = self.live_channel()?;
        let reply = self
            .matcher
            .request(&channel, &DeviceCommand::Query.frame(), summary_pattern())
            .await?;
        log::info!(
            "[bridge] Distance summary {} (attempt {})",
            reply.value,
            reply.attempts
        );
        Ok(reply)
    }

    fn route_line(&self, line: &str) {
        match classify(line, Utc::now()) {
            LineClass::Passthrough(text) => {
                self.hub.broadcast(BroadcastEvent::Serial { text });
            }
            LineClass::Telemetry(record) => {
                self.sink.record(&record);
                self.hub.broadcast(BroadcastEvent::Telemetry(record));
            }
            LineClass::Ignored => {}
        }
    }
}

/// Feed inbound lines through the classifier into the hub until the channel closes.
async fn pump_inbound(
    bridge: Weak<Bridge>,
    mut events: broadcast::Receiver<ChannelEvent>,
    generation: u64,
) {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Line(line)) => match bridge.upgrade() {
                Some(bridge) => bridge.route_line(&line),
                None => return,
            },
            Ok(ChannelEvent::Closed {
                reason: Some(reason),
            }) => {
                if let Some(bridge) = bridge.upgrade() {
                    bridge.on_channel_lost(generation, &reason).await;
                }
                return;
            }
            Ok(ChannelEvent::Closed { reason: None }) | Err(broadcast::error::RecvError::Closed) => {
                return;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("[bridge] Inbound pipeline lagged by {} lines", n);
            }
        }
    }
}

/// Turn every ledger change into a trigger command.
async fn relay_changes(
    channel: SerialHandle,
    hub: Arc<BroadcastHub>,
    mut changes: mpsc::Receiver<AccountChange>,
) {
    while let Some(change) = changes.recv().await {
        match channel.write(&DeviceCommand::Trigger.frame()).await {
            Ok(()) => {
                log::info!("[bridge] Ledger change at slot {:?}, sent trigger", change.slot);
                hub.broadcast(BroadcastEvent::Sent {
                    command: DeviceCommand::Trigger.as_str().to_string(),
                    source: LEDGER_SOURCE.to_string(),
                });
            }
            Err(e) => log::warn!("[bridge] Ledger-triggered write failed: {}", e),
        }
    }
}
