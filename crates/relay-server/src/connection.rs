//! WebSocket client connection state and its owned subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relay_wire::{RequestId, ResponseEnvelope};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The unsubscribe capability of one live subscription.
///
/// Cancelling the token ends the forwarding task without emitting anything;
/// the path that removed the subscription owns any final envelope.
#[derive(Debug)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    /// Create a handle around the forwarding task's token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Invoke the unsubscribe capability.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the capability has been invoked.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Generate a fresh connection id.
pub fn connection_id() -> String {
    format!("conn_{}", Uuid::now_v7())
}

/// Represents a connected WebSocket client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: String,
    /// Send channel to the connection's write task.
    tx: mpsc::Sender<String>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded since the last ping.
    pub is_alive: AtomicBool,
    /// When the last Pong (or any activity) was received.
    last_pong: Mutex<Instant>,
    /// Count of messages dropped due to a full channel.
    pub dropped_messages: AtomicU64,
    /// Active subscriptions keyed by request id.
    subscriptions: Mutex<HashMap<RequestId, SubscriptionHandle>>,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: String, tx: mpsc::Sender<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Send a text message to the client.
    ///
    /// Returns `false` if the channel is full or closed, and increments the
    /// dropped message counter.
    pub fn send(&self, message: String) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Encode and send a response envelope.
    pub fn send_envelope(&self, envelope: &ResponseEnvelope) -> bool {
        self.send(envelope.encode())
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Register a subscription under `id`.
    ///
    /// At most one subscription may exist per id. On collision the existing
    /// subscription is removed and returned as the error; the new handle is
    /// NOT registered.
    pub fn register_subscription(
        &self,
        id: RequestId,
        handle: SubscriptionHandle,
    ) -> Result<(), SubscriptionHandle> {
        let mut subs = self.subscriptions.lock();
        match subs.entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => Err(entry.remove()),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let _ = entry.insert(handle);
                Ok(())
            }
        }
    }

    /// Remove and return the subscription registered under `id`.
    pub fn take_subscription(&self, id: &RequestId) -> Option<SubscriptionHandle> {
        self.subscriptions.lock().remove(id)
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Remove every subscription (connection teardown).
    pub fn drain_subscriptions(&self) -> Vec<SubscriptionHandle> {
        self.subscriptions.lock().drain().map(|(_, h)| h).collect()
    }
}
