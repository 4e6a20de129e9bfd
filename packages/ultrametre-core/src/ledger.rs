//! External ledger watch
//!
//! While the bridge runs it watches one ledger account and turns every change
//! notification into a device trigger. [`LedgerWatch`] is the seam:
//! [`SolanaAccountWatch`] talks to a Solana JSON-RPC pub/sub endpoint,
//! [`ManualLedgerWatch`] is driven by hand from tests.

use crate::error::BridgeError;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub const DEFAULT_LEDGER_WS_URL: &str = "wss://api.devnet.solana.com";
pub const DEFAULT_WATCH_ACCOUNT: &str = "DsjJMaAxPoXARLsCW3uc3ThheAiy4b5ebUB7WzufDKwd";
pub const DEFAULT_COMMITMENT: &str = "processed";

/// How long `unsubscribe` waits for the watch task before aborting it.
const UNSUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(3);

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

const SUBSCRIBE_REQUEST_ID: u64 = 1;
const UNSUBSCRIBE_REQUEST_ID: u64 = 2;

/// One change notification for the watched account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountChange {
    /// Ledger slot of the change, when the source reports one
    pub slot: Option<u64>,
}

/// Source of account change notifications.
pub trait LedgerWatch: Send + Sync {
    /// Start watching. Every change is sent to `changes` until the returned
    /// handle is unsubscribed or dropped.
    fn subscribe(&self, changes: mpsc::Sender<AccountChange>) -> Result<WatchHandle, BridgeError>;
}

// ============================================
// Watch Handle
// ============================================

/// Live subscription. Dropping it cancels the watch without waiting.
pub struct WatchHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), BridgeError>>>,
}

impl WatchHandle {
    /// Wrap a watch task that exits (returning its teardown result) once
    /// `cancel` fires or is dropped.
    pub fn new(cancel: oneshot::Sender<()>, task: JoinHandle<Result<(), BridgeError>>) -> Self {
        Self {
            cancel: Some(cancel),
            task: Some(task),
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    /// Cancel the watch and wait for its teardown. Calling it again is a no-op.
    pub async fn unsubscribe(&mut self) -> Result<(), BridgeError> {
        let Some(cancel) = self.cancel.take() else {
            return Ok(());
        };
        let _ = cancel.send(());

        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(UNSUBSCRIBE_TIMEOUT, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(BridgeError::Watch(format!("watch task failed: {}", e))),
            Err(_) => {
                abort.abort();
                Err(BridgeError::Watch("unsubscribe timed out".to_string()))
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

// ============================================
// Solana Account Watch
// ============================================

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Watches one account through Solana's `accountSubscribe` websocket API.
///
/// Reconnects with exponential backoff when the socket drops.
#[derive(Debug, Clone)]
pub struct SolanaAccountWatch {
    ws_url: String,
    account: String,
    commitment: String,
}

impl SolanaAccountWatch {
    pub fn new(
        ws_url: impl Into<String>,
        account: impl Into<String>,
        commitment: impl Into<String>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            account: account.into(),
            commitment: commitment.into(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    fn subscribe_request(&self) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": SUBSCRIBE_REQUEST_ID,
            "method": "accountSubscribe",
            "params": [
                self.account,
                { "encoding": "base64", "commitment": self.commitment }
            ]
        })
    }

    async fn run(
        self,
        changes: mpsc::Sender<AccountChange>,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<(), BridgeError> {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.session(&changes, &mut cancel, &mut backoff).await {
                SessionEnd::Finished(result) => return result,
                SessionEnd::Lost(reason) => {
                    log::warn!("[ledger] {} (retrying in {:?})", reason, backoff);
                }
            }

            tokio::select! {
                _ = &mut cancel => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
        }
    }

    /// One connection, from connect to loss or cancellation.
    async fn session(
        &self,
        changes: &mpsc::Sender<AccountChange>,
        cancel: &mut oneshot::Receiver<()>,
        backoff: &mut Duration,
    ) -> SessionEnd {
        let connected = tokio::select! {
            _ = &mut *cancel => return SessionEnd::Finished(Ok(())),
            result = tokio_tungstenite::connect_async(self.ws_url.as_str()) => result,
        };
        let (ws_stream, _response) = match connected {
            Ok(pair) => pair,
            Err(e) => return SessionEnd::Lost(format!("connect to {} failed: {}", self.ws_url, e)),
        };
        let (mut sink, mut stream) = ws_stream.split();

        let request = self.subscribe_request().to_string();
        if let Err(e) = sink.send(Message::Text(request)).await {
            return SessionEnd::Lost(format!("accountSubscribe send failed: {}", e));
        }

        let mut subscription_id = None;
        loop {
            tokio::select! {
                _ = &mut *cancel => {
                    return SessionEnd::Finished(close_session(&mut sink, subscription_id).await);
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => match parse_message(&text) {
                        RpcMessage::Subscribed(id) => {
                            log::info!("[ledger] Watching {} (subscription {})", self.account, id);
                            subscription_id = Some(id);
                            *backoff = INITIAL_BACKOFF;
                        }
                        RpcMessage::Notification { slot } => {
                            log::debug!("[ledger] Account changed at slot {:?}", slot);
                            if changes.send(AccountChange { slot }).await.is_err() {
                                // Nobody is listening any more
                                return SessionEnd::Finished(close_session(&mut sink, subscription_id).await);
                            }
                        }
                        RpcMessage::Error(message) => {
                            return SessionEnd::Lost(format!("rpc error: {}", message));
                        }
                        RpcMessage::Other => {}
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost("socket closed".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(format!("read error: {}", e)),
                }
            }
        }
    }
}

impl LedgerWatch for SolanaAccountWatch {
    fn subscribe(&self, changes: mpsc::Sender<AccountChange>) -> Result<WatchHandle, BridgeError> {
        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(BridgeError::Watch(format!(
                "invalid websocket url: {}",
                self.ws_url
            )));
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(self.clone().run(changes, cancel_rx));
        Ok(WatchHandle::new(cancel_tx, task))
    }
}

enum SessionEnd {
    /// Cancelled or no longer needed; carries the teardown result
    Finished(Result<(), BridgeError>),
    /// Connection lost; reconnect after backoff
    Lost(String),
}

async fn close_session(sink: &mut WsSink, subscription_id: Option<u64>) -> Result<(), BridgeError> {
    let mut result = Ok(());
    if let Some(id) = subscription_id {
        let request = json!({
            "jsonrpc": "2.0",
            "id": UNSUBSCRIBE_REQUEST_ID,
            "method": "accountUnsubscribe",
            "params": [id]
        });
        if let Err(e) = sink.send(Message::Text(request.to_string())).await {
            result = Err(BridgeError::Watch(format!("accountUnsubscribe failed: {}", e)));
        }
    }
    if let Err(e) = sink.close().await {
        log::debug!("[ledger] Close failed: {}", e);
    }
    log::info!("[ledger] Watch closed");
    result
}

/// A decoded pub/sub message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    /// Reply to our `accountSubscribe`, carrying the subscription id
    Subscribed(u64),
    Notification { slot: Option<u64> },
    Error(String),
    Other,
}

pub fn parse_message(text: &str) -> RpcMessage {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return RpcMessage::Other;
    };

    if value["method"] == "accountNotification" {
        let slot = value["params"]["result"]["context"]["slot"].as_u64();
        return RpcMessage::Notification { slot };
    }

    if let Some(error) = value.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown error");
        return RpcMessage::Error(message.to_string());
    }

    if value["id"] == SUBSCRIBE_REQUEST_ID {
        if let Some(id) = value["result"].as_u64() {
            return RpcMessage::Subscribed(id);
        }
    }

    RpcMessage::Other
}

// ============================================
// Manual Watch (tests)
// ============================================

#[derive(Default)]
struct ManualState {
    changes: Mutex<Option<mpsc::Sender<AccountChange>>>,
    fail_next: Mutex<Option<String>>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

impl ManualState {
    fn changes(&self) -> MutexGuard<'_, Option<mpsc::Sender<AccountChange>>> {
        self.changes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ledger watch driven by hand. Clones share state.
#[derive(Clone, Default)]
pub struct ManualLedgerWatch {
    state: Arc<ManualState>,
}

impl ManualLedgerWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a change notification. Returns false if nothing is subscribed.
    pub fn notify(&self, slot: Option<u64>) -> bool {
        match self.state.changes().as_ref() {
            Some(tx) => tx.try_send(AccountChange { slot }).is_ok(),
            None => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.changes().is_some()
    }

    /// Make the next subscribe fail with `reason`.
    pub fn fail_next_subscribe(&self, reason: &str) {
        *self
            .state
            .fail_next
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason.to_string());
    }

    pub fn subscribe_count(&self) -> usize {
        self.state.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state.unsubscribes.load(Ordering::SeqCst)
    }
}

impl LedgerWatch for ManualLedgerWatch {
    fn subscribe(&self, changes: mpsc::Sender<AccountChange>) -> Result<WatchHandle, BridgeError> {
        let failure = self
            .state
            .fail_next
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reason) = failure {
            return Err(BridgeError::Watch(reason));
        }

        *self.state.changes() = Some(changes);
        self.state.subscribes.fetch_add(1, Ordering::SeqCst);

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            let _ = cancel_rx.await;
            state.changes().take();
            state.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        Ok(WatchHandle::new(cancel_tx, task))
    }
}
