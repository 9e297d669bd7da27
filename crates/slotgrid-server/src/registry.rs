//! Registry of active observers and broadcast fan-out.
//!
//! Every observer owns two outbound paths drained by its own session:
//!
//! - a bounded reply queue. A requester reserves room in it before its claim
//!   touches the table, so a client that pipelines requests is slowed down in
//!   its own reader loop instead of being dropped.
//! - a latest-snapshot cell (`tokio::sync::watch`). Broadcasting never waits
//!   and never fails on a slow peer: a snapshot the peer has not picked up yet
//!   is replaced by the newer one, which carries strictly more state.
//!
//! A cell only ever moves to a higher table version, so every observer sees
//! snapshot versions strictly increasing no matter how broadcasts interleave.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, watch, Notify};
use tracing::debug;

use crate::protocol::{ClaimReply, SnapshotMessage};

/// Identifier of one observer session. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// Reserved room for one reply in an observer's queue.
pub type ReplyPermit = mpsc::OwnedPermit<ClaimReply>;

/// Session-side end of a registration.
#[derive(Debug)]
pub struct ObserverInbox {
    pub id: ObserverId,
    /// Direct replies for this observer, in request order.
    pub replies: mpsc::Receiver<ClaimReply>,
    /// Newest snapshot not yet picked up. Starts marked changed.
    pub snapshots: watch::Receiver<Option<SnapshotMessage>>,
    /// Fires when the observer is forcibly stopped.
    pub stop: Arc<Notify>,
}

#[derive(Debug, Clone)]
struct ObserverHandle {
    replies: mpsc::Sender<ClaimReply>,
    snapshots: Arc<watch::Sender<Option<SnapshotMessage>>>,
    stop: Arc<Notify>,
}

impl ObserverHandle {
    /// Offer `snapshot` unless the cell already holds the same or a newer one.
    fn offer(&self, snapshot: &SnapshotMessage) -> bool {
        self.snapshots.send_if_modified(|current| match current {
            Some(held) if held.version >= snapshot.version => false,
            _ => {
                *current = Some(snapshot.clone());
                true
            }
        })
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Observers whose snapshot cell now holds the broadcast state.
    pub delivered: usize,
    /// Observers dropped because their session is gone.
    pub closed: usize,
}

/// The set of active observers.
#[derive(Debug)]
pub struct ObserverRegistry {
    observers: RwLock<HashMap<ObserverId, ObserverHandle>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl ObserverRegistry {
    /// Create an empty registry with `buffer` slots per reply queue.
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObserverId, ObserverHandle>> {
        self.observers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObserverId, ObserverHandle>> {
        self.observers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an observer whose snapshot cell starts with `initial()`.
    ///
    /// The observer joins the active set before `initial()` is taken, so no
    /// broadcast can fall between its initial snapshot and the live feed.
    pub fn register<F>(&self, initial: F) -> ObserverInbox
    where
        F: FnOnce() -> SnapshotMessage,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (replies_tx, replies) = mpsc::channel(self.buffer);
        let (snapshots_tx, snapshots) = watch::channel(None);
        let stop = Arc::new(Notify::new());

        let handle = ObserverHandle {
            replies: replies_tx,
            snapshots: Arc::new(snapshots_tx),
            stop: Arc::clone(&stop),
        };
        self.write().insert(id, handle.clone());
        handle.offer(&initial());
        debug!("{} registered", id);

        ObserverInbox {
            id,
            replies,
            snapshots,
            stop,
        }
    }

    /// Remove an observer. Returns whether it was present.
    pub fn remove(&self, id: ObserverId) -> bool {
        let removed = self.write().remove(&id).is_some();
        if removed {
            debug!("{} removed", id);
        }
        removed
    }

    /// Forcibly stop one observer: remove it and signal its session to close.
    pub fn disconnect(&self, id: ObserverId) -> bool {
        match self.write().remove(&id) {
            Some(handle) => {
                handle.stop.notify_one();
                debug!("{} disconnected", id);
                true
            }
            None => false,
        }
    }

    /// Forcibly stop every observer. Returns how many were stopped.
    pub fn disconnect_all(&self) -> usize {
        let drained: Vec<_> = self.write().drain().collect();
        for (_, handle) in &drained {
            handle.stop.notify_one();
        }
        drained.len()
    }

    /// Wait for room in one observer's reply queue.
    ///
    /// `None` when the observer is not active or its session is gone.
    pub async fn reserve_reply(&self, id: ObserverId) -> Option<ReplyPermit> {
        let replies = self.read().get(&id).map(|handle| handle.replies.clone())?;
        replies.reserve_owned().await.ok()
    }

    /// Offer `make()` to every active observer.
    ///
    /// Never waits and never fails as a whole: observers whose session is gone
    /// are dropped from the set and counted in the report.
    pub fn broadcast<F>(&self, make: F) -> BroadcastReport
    where
        F: FnOnce() -> SnapshotMessage,
    {
        let targets: Vec<(ObserverId, ObserverHandle)> = self
            .read()
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        let snapshot = make();

        let mut report = BroadcastReport::default();
        for (id, handle) in &targets {
            if handle.snapshots.is_closed() {
                debug!("{} session gone, dropping", id);
                self.remove(*id);
                report.closed += 1;
                continue;
            }
            handle.offer(&snapshot);
            report.delivered += 1;
        }
        report
    }

    /// Whether the observer is in the active set.
    pub fn contains(&self, id: ObserverId) -> bool {
        self.read().contains_key(&id)
    }

    /// Active observer ids, in registration order.
    pub fn ids(&self) -> Vec<ObserverId> {
        let mut ids: Vec<_> = self.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of active observers.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
