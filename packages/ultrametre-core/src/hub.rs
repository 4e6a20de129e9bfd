//! Subscriber Broadcast Hub
//!
//! Fans named events out to every live subscriber. Each subscriber gets its
//! own bounded queue, so a slow or dead subscriber never holds up the others.
//! There is no replay: a subscriber only sees events broadcast after it
//! registered.

use crate::BroadcastEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

/// Per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Unique identity of a subscriber.
pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<BroadcastEvent>,
}

pub struct BroadcastHub {
    next_id: AtomicU64,
    /// Registration order is delivery order
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber. Dropping the returned [`Subscription`] unsubscribes it.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers().push(Subscriber { id, tx });
        log::debug!("[hub] Subscriber {} registered", id);

        Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove a subscriber. Unknown or already-removed ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut subscribers = self.subscribers();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() != before {
            log::debug!("[hub] Subscriber {} removed", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Deliver `event` to every current subscriber in registration order.
    ///
    /// Never blocks. A subscriber whose queue is full misses this event; one
    /// whose receiver is gone is pruned. Returns how many subscribers accepted it.
    pub fn broadcast(&self, event: BroadcastEvent) -> usize {
        let mut subscribers = self.subscribers();
        let mut delivered = 0;

        subscribers.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "[hub] Subscriber {} is full, dropping {} event",
                    subscriber.id,
                    event.name()
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("[hub] Subscriber {} gone, pruning", subscriber.id);
                false
            }
        });

        delivered
    }
}

/// Receiving end of one subscriber.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<BroadcastEvent>,
    hub: Weak<BroadcastHub>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BroadcastEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}
