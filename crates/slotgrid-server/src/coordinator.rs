//! Claim arbitration and state propagation.
//!
//! The coordinator owns the slot table and the observer registry. A claim is
//! applied under the slot's own guard, answered to the requester, and, only
//! when accepted, followed by exactly one full-table broadcast.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use slotgrid_table::{ClaimOutcome, ClaimantId, SlotId, SlotTable, Snapshot};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::{ClaimReply, ClientRequest, SnapshotMessage};
use crate::registry::{BroadcastReport, ObserverId, ObserverInbox, ObserverRegistry};

/// What happened to one claim request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// Slot was FREE and is now held by the requester; one broadcast was sent.
    Accepted {
        version: u64,
        broadcast: BroadcastReport,
    },
    /// Slot was already HELD; no state change, no broadcast.
    Rejected { holder: ClaimantId },
    /// Slot id is not in the table; no state change, no broadcast.
    UnknownSlot,
}

/// Owner of the authoritative table and the active-observer set.
#[derive(Debug)]
pub struct Coordinator {
    table: SlotTable,
    observers: ObserverRegistry,
    config: ServerConfig,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    /// Build a coordinator with an all-FREE grid sized by `config`.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let table = SlotTable::grid(config.rows, config.cols)?;
        Ok(Self::with_table(table, config))
    }

    /// Build a coordinator around an existing table.
    pub fn with_table(table: SlotTable, config: ServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            observers: ObserverRegistry::new(config.outbound_buffer),
            table,
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn table(&self) -> &SlotTable {
        &self.table
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Point-in-time copy of the table.
    pub fn snapshot(&self) -> Snapshot {
        self.table.snapshot()
    }

    /// Register a new observer; its snapshot cell starts with the current table.
    pub fn join(&self) -> ObserverInbox {
        self.observers
            .register(|| SnapshotMessage::from(&self.table.snapshot()))
    }

    /// Remove an observer from the active set.
    pub fn leave(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Forcibly stop one observer.
    pub fn disconnect(&self, id: ObserverId) -> bool {
        self.observers.disconnect(id)
    }

    /// Apply one decoded request from `observer`.
    pub async fn handle(&self, observer: ObserverId, request: ClientRequest) -> ClaimResult {
        match request {
            ClientRequest::Book {
                ticket_id,
                client_name,
            } => self.claim(observer, &ticket_id, client_name).await,
        }
    }

    /// Claim `slot` for `claimant` on behalf of `observer`.
    ///
    /// Waits for room in the requester's reply queue first. Once the table has
    /// been touched nothing awaits, so a cancelled claim never leaves an
    /// accepted slot without its reply and broadcast.
    pub async fn claim(
        &self,
        observer: ObserverId,
        slot: &SlotId,
        claimant: ClaimantId,
    ) -> ClaimResult {
        let permit = self.observers.reserve_reply(observer).await;

        let (result, reply) = match self.table.try_claim(slot.as_str(), claimant.clone()) {
            Ok(ClaimOutcome::Accepted { version }) => {
                info!("Ticket {} booked successfully by {}.", slot, claimant);
                let accepted = ClaimResult::Accepted {
                    version,
                    broadcast: BroadcastReport::default(),
                };
                (accepted, ClaimReply::booked(slot))
            }
            Ok(ClaimOutcome::Rejected { holder }) => {
                info!(
                    "Ticket {} is already booked (held by {}, requested by {}).",
                    slot, holder, claimant
                );
                (ClaimResult::Rejected { holder }, ClaimReply::already_booked(slot))
            }
            Err(e) => {
                warn!("{}: claim by {} refused: {}", observer, claimant, e);
                (ClaimResult::UnknownSlot, ClaimReply::unknown(slot))
            }
        };

        match permit {
            Some(permit) => {
                permit.send(reply);
            }
            None => debug!("{} is gone, reply dropped", observer),
        }

        match result {
            ClaimResult::Accepted { version, .. } => ClaimResult::Accepted {
                version,
                broadcast: self.publish(),
            },
            other => other,
        }
    }

    /// Queue a direct reply for one observer, waiting for room.
    pub async fn reply(&self, observer: ObserverId, reply: ClaimReply) -> bool {
        match self.observers.reserve_reply(observer).await {
            Some(permit) => {
                permit.send(reply);
                true
            }
            None => false,
        }
    }

    /// Broadcast the current snapshot to every active observer.
    fn publish(&self) -> BroadcastReport {
        let report = self
            .observers
            .broadcast(|| SnapshotMessage::from(&self.table.snapshot()));
        if report.closed > 0 {
            debug!(
                "Broadcast reached {} observers, dropped {} closed",
                report.delivered, report.closed
            );
        }
        report
    }

    /// Stop every session and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let stopped = self.observers.disconnect_all();
        info!("Shutting down, stopped {} observers", stopped);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReplyStatus;
    use std::sync::Arc;
    use std::time::Duration;

    fn coordinator() -> Coordinator {
        Coordinator::new(ServerConfig::default()).unwrap()
    }

    /// Take the pending snapshot, if any.
    fn take(inbox: &mut ObserverInbox) -> Option<SnapshotMessage> {
        if inbox.snapshots.has_changed().unwrap_or(false) {
            inbox.snapshots.borrow_and_update().clone()
        } else {
            None
        }
    }

    fn claim_result(version: u64, delivered: usize) -> ClaimResult {
        ClaimResult::Accepted {
            version,
            broadcast: BroadcastReport {
                delivered,
                closed: 0,
            },
        }
    }

    #[tokio::test]
    async fn accepted_claim_replies_then_broadcasts() {
        let coordinator = coordinator();
        let mut x = coordinator.join();
        let mut y = coordinator.join();
        take(&mut x);
        take(&mut y);

        let result = coordinator
            .claim(x.id, &SlotId::from("ticket_0_0"), ClaimantId::from("A"))
            .await;

        assert_eq!(result, claim_result(1, 2));
        assert_eq!(x.replies.recv().await.unwrap().status, ReplyStatus::Success);
        for inbox in [&mut x, &mut y] {
            let s = take(inbox).expect("broadcast snapshot");
            assert_eq!(s.tickets.get("ticket_0_0"), Some(&true));
            assert_eq!(s.tickets.values().filter(|b| **b).count(), 1);
        }
        assert!(y.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_claim_never_broadcasts() {
        let coordinator = coordinator();
        let mut x = coordinator.join();
        let mut y = coordinator.join();
        coordinator
            .claim(x.id, &SlotId::from("ticket_1_1"), ClaimantId::from("A"))
            .await;
        x.replies.recv().await.unwrap();
        take(&mut x);
        take(&mut y);

        let result = coordinator
            .claim(y.id, &SlotId::from("ticket_1_1"), ClaimantId::from("B"))
            .await;

        assert_eq!(
            result,
            ClaimResult::Rejected {
                holder: ClaimantId::from("A")
            }
        );
        let reply = y.replies.recv().await.unwrap();
        assert_eq!(reply.message, "Ticket ticket_1_1 is already booked.");
        assert!(x.replies.try_recv().is_err());
        assert!(take(&mut x).is_none());
        assert!(take(&mut y).is_none());
    }

    #[tokio::test]
    async fn unknown_slot_only_informs_requester() {
        let coordinator = coordinator();
        let mut x = coordinator.join();
        let mut y = coordinator.join();
        take(&mut x);
        take(&mut y);
        let before = coordinator.snapshot();

        let result = coordinator
            .claim(x.id, &SlotId::from("ticket_9_9"), ClaimantId::from("A"))
            .await;

        assert_eq!(result, ClaimResult::UnknownSlot);
        let reply = x.replies.recv().await.unwrap();
        assert_eq!(reply.status, ReplyStatus::Error);
        assert!(y.replies.try_recv().is_err());
        assert!(take(&mut y).is_none());
        assert_eq!(coordinator.snapshot(), before);
    }

    #[tokio::test]
    async fn full_reply_queue_makes_requester_wait() {
        let coordinator = Arc::new(
            Coordinator::new(ServerConfig {
                outbound_buffer: 1,
                ..ServerConfig::default()
            })
            .unwrap(),
        );
        let mut x = coordinator.join();
        coordinator
            .claim(x.id, &SlotId::from("ticket_0_0"), ClaimantId::from("A"))
            .await;

        // reply queue is full, so the next claim holds off before touching the table
        let pending = {
            let coordinator = Arc::clone(&coordinator);
            let id = x.id;
            tokio::spawn(async move {
                coordinator
                    .claim(id, &SlotId::from("ticket_0_1"), ClaimantId::from("A"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        assert_eq!(coordinator.table().version(), 1);
        assert!(coordinator.observers().contains(x.id));

        assert!(x.replies.recv().await.unwrap().is_success());
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, claim_result(2, 1));
        assert!(x.replies.recv().await.unwrap().is_success());
        assert_eq!(take(&mut x).unwrap().version, 2);
    }

    #[tokio::test]
    async fn claim_from_departed_observer_still_applies() {
        let coordinator = coordinator();
        let gone = coordinator.join().id;
        let mut y = coordinator.join();
        take(&mut y);

        let result = coordinator
            .claim(gone, &SlotId::from("ticket_2_0"), ClaimantId::from("A"))
            .await;

        assert_eq!(
            result,
            ClaimResult::Accepted {
                version: 1,
                broadcast: BroadcastReport {
                    delivered: 1,
                    closed: 1,
                },
            }
        );
        assert!(!coordinator.observers().contains(gone));
        assert_eq!(take(&mut y).unwrap().version, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_everyone() {
        let coordinator = coordinator();
        let x = coordinator.join();
        let mut signal = coordinator.shutdown_signal();

        coordinator.shutdown();

        assert!(coordinator.is_shutting_down());
        assert!(coordinator.observers().is_empty());
        tokio_test::assert_ok!(signal.wait_for(|stopping| *stopping).await);
        tokio::time::timeout(Duration::from_secs(1), x.stop.notified())
            .await
            .unwrap();
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ServerConfig {
            rows: 0,
            ..ServerConfig::default()
        };
        assert!(Coordinator::new(config).is_err());
    }
}
