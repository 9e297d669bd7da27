//! JSON wire protocol between the server and its observers.
//!
//! Observers send claim requests tagged by `action`:
//!
//! ```text
//! {"action": "book", "ticket_id": "ticket_0_0", "client_name": "Client 1"}
//! ```
//!
//! The server sends two untagged shapes: full-table snapshots
//! (`{"tickets": {...}, "holders": {...}, "version": n}`) to every observer, and
//! claim replies (`{"status": "success" | "error", "message": "..."}`) to the
//! requester only. Viewers only need `tickets`; `holders` and `version` are
//! additive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use slotgrid_table::{ClaimantId, SlotId, Snapshot};

use crate::error::{Error, Result};

/// A request from an observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Claim one slot for `client_name`.
    Book {
        ticket_id: SlotId,
        client_name: ClaimantId,
    },
}

/// Decode one inbound text payload.
///
/// `client_name` is taken as given, blank names included.
pub fn decode_request(text: &str) -> Result<ClientRequest> {
    serde_json::from_str(text).map_err(|e| Error::Decode(e.to_string()))
}

/// Decode one inbound binary payload (UTF-8 JSON).
pub fn decode_request_bytes(bytes: &[u8]) -> Result<ClientRequest> {
    let text = std::str::from_utf8(bytes).map_err(|e| Error::Decode(e.to_string()))?;
    decode_request(text)
}

/// Full-table broadcast payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    /// Occupancy of every slot.
    pub tickets: BTreeMap<SlotId, bool>,
    /// Holder of every occupied slot.
    #[serde(default)]
    pub holders: BTreeMap<SlotId, ClaimantId>,
    /// Table version the snapshot was taken at.
    #[serde(default)]
    pub version: u64,
}

impl From<&Snapshot> for SnapshotMessage {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            tickets: snapshot.occupancy(),
            holders: snapshot.holders(),
            version: snapshot.version(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Direct answer to one request, sent only to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReply {
    pub status: ReplyStatus,
    pub message: String,
}

impl ClaimReply {
    pub fn booked(id: &SlotId) -> Self {
        Self {
            status: ReplyStatus::Success,
            message: format!("Ticket {} booked successfully.", id),
        }
    }

    pub fn already_booked(id: &SlotId) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: format!("Ticket {} is already booked.", id),
        }
    }

    pub fn unknown(id: &SlotId) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: format!("Ticket {} does not exist.", id),
        }
    }

    pub fn malformed(detail: &str) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: format!("Malformed request: {}", detail),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }
}

/// Any message the server sends to an observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Snapshot(SnapshotMessage),
    Reply(ClaimReply),
}

impl ServerMessage {
    pub fn snapshot(snapshot: &Snapshot) -> Self {
        ServerMessage::Snapshot(SnapshotMessage::from(snapshot))
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
