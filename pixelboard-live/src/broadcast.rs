//! Fan-out of drained board changes to every subscriber.
//!
//! Each subscriber owns a bounded mpsc channel. A broadcast tick drains the
//! board once, encodes the batch once, and `try_send`s the same
//! `Arc<Vec<u8>>` into every channel. A subscriber whose channel is full is
//! removed on the spot: its handle yields the already-buffered batches and
//! then [`RecvError::Overflow`], and the connection is torn down. Nobody
//! silently loses pixels while staying connected.
//!
//! ```text
//!  Board::drain_changes ──► encode once ──┬──► [cap] ──► subscriber A
//!        (every T)                        ├──► [cap] ──► subscriber B
//!                                         └──► [full] ✗  dropped
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::board::{Board, PixelChange};
use crate::protocol::{ProtocolError, ServerMessage};

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Milliseconds between drains of the board's change log
    pub broadcast_interval_ms: u64,
    /// Batches buffered per subscriber before it is dropped
    pub subscriber_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 500,
            subscriber_capacity: 64,
        }
    }
}

impl HubConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms.max(1))
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub batches_sent: u64,
    pub changes_sent: u64,
    pub subscribers_dropped: u64,
    pub active_subscribers: usize,
}

/// Counters updated on the fan-out path without taking the subscriber lock.
#[derive(Default)]
struct AtomicHubStats {
    batches_sent: AtomicU64,
    changes_sent: AtomicU64,
    subscribers_dropped: AtomicU64,
}

/// Why a subscription stopped yielding batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// The subscriber fell behind and was dropped; it must resubscribe
    #[error("Subscriber overflow: channel full, subscription dropped")]
    Overflow,
    /// The subscription was removed or the hub shut down
    #[error("Subscription closed")]
    Closed,
}

struct Slot {
    tx: mpsc::Sender<Arc<Vec<u8>>>,
    overflowed: Arc<AtomicBool>,
}

/// Receiving end of one subscription.
///
/// Owned by exactly one connection; never cloned.
pub struct SubscriberHandle {
    id: Uuid,
    rx: mpsc::Receiver<Arc<Vec<u8>>>,
    overflowed: Arc<AtomicBool>,
}

impl SubscriberHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the next encoded `ServerMessage::Changes` frame.
    pub async fn recv(&mut self) -> Result<Arc<Vec<u8>>, RecvError> {
        match self.rx.recv().await {
            Some(frame) => Ok(frame),
            None => Err(self.end_reason()),
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv). `Ok(None)` means nothing is queued yet.
    pub fn try_recv(&mut self) -> Result<Option<Arc<Vec<u8>>>, RecvError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(self.end_reason()),
        }
    }

    /// Whether the hub dropped this subscriber for falling behind.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    fn end_reason(&self) -> RecvError {
        if self.overflowed() {
            RecvError::Overflow
        } else {
            RecvError::Closed
        }
    }
}

/// Owns the active subscriber set and performs fan-out.
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<Uuid, Slot>>,
    capacity: usize,
    stats: AtomicHubStats,
}

impl BroadcastHub {
    /// `capacity` is the number of batches a subscriber may have queued
    /// before it is dropped.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicHubStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a new subscriber.
    pub async fn subscribe(&self) -> SubscriberHandle {
        let (tx, rx) = mpsc::channel(self.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));
        let id = Uuid::new_v4();

        self.subscribers.write().await.insert(
            id,
            Slot {
                tx,
                overflowed: overflowed.clone(),
            },
        );
        log::debug!("Subscriber {id} registered");

        SubscriberHandle { id, rx, overflowed }
    }

    /// Remove a subscriber. Returns whether it was still registered;
    /// repeated calls are harmless.
    pub async fn unsubscribe(&self, id: &Uuid) -> bool {
        let removed = self.subscribers.write().await.remove(id).is_some();
        if removed {
            log::debug!("Subscriber {id} removed");
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_subscribed(&self, id: &Uuid) -> bool {
        self.subscribers.read().await.contains_key(id)
    }

    /// Encode `changes` once and push the frame to every subscriber.
    ///
    /// Never waits on a subscriber. Returns how many subscribers received
    /// the frame.
    pub async fn broadcast(&self, changes: &[PixelChange]) -> Result<usize, ProtocolError> {
        let frame = Arc::new(ServerMessage::Changes(changes.to_vec()).encode()?);

        // Snapshot the targets so connects/disconnects never wait on fan-out
        let targets: Vec<(Uuid, mpsc::Sender<Arc<Vec<u8>>>, Arc<AtomicBool>)> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .map(|(id, slot)| (*id, slot.tx.clone(), slot.overflowed.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx, overflowed) in &targets {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    overflowed.store(true, Ordering::Release);
                    log::warn!("Subscriber {id} overflowed ({} batches queued), dropping it", self.capacity);
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        drop(targets);

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in &dead {
                if subscribers.remove(id).is_some() {
                    self.stats.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .changes_sent
            .fetch_add(changes.len() as u64, Ordering::Relaxed);

        Ok(delivered)
    }

    /// One cadence step: drain the board and fan out a non-empty batch.
    ///
    /// Returns the number of subscribers that received a batch.
    pub async fn tick(&self, board: &Board) -> usize {
        let changes = board.drain_changes();
        if changes.is_empty() {
            return 0;
        }

        match self.broadcast(&changes).await {
            Ok(delivered) => {
                log::trace!("Broadcast {} change(s) to {delivered} subscriber(s)", changes.len());
                delivered
            }
            Err(e) => {
                log::error!("Failed to encode batch of {} change(s): {e}", changes.len());
                0
            }
        }
    }

    /// Spawn the broadcast cadence. This task is the board's only drainer.
    pub fn spawn_cadence(self: Arc<Self>, board: Arc<Board>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick(&board).await;
            }
        })
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            batches_sent: self.stats.batches_sent.load(Ordering::Relaxed),
            changes_sent: self.stats.changes_sent.load(Ordering::Relaxed),
            subscribers_dropped: self.stats.subscribers_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().await.len(),
        }
    }
}
