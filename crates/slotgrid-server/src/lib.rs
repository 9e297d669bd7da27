//! SlotGrid Coordination Server
//!
//! Lets many remote observers watch and contend for a fixed grid of slots.
//! The server owns the authoritative [`slotgrid_table::SlotTable`], arbitrates
//! claims with per-slot exclusion, and pushes full-table snapshots to every
//! connected observer after each accepted claim.
//!
//! # Architecture
//!
//! - **Protocol**: JSON messages over WebSocket (`book` requests, snapshots, replies)
//! - **Registry**: active observers, each with a bounded reply queue and a
//!   latest-snapshot cell
//! - **Coordinator**: claim flow: try claim, reply, broadcast on accept
//! - **Session**: one task per connection, `Connecting → Active → Closed`
//! - **Server**: axum router with the WebSocket route and a read-only REST API
//!
//! # Usage
//!
//! ```no_run
//! use slotgrid_server::{ServerConfig, SlotServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = SlotServer::new(ServerConfig::from_env()?)?;
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{MalformedPolicy, ServerConfig};
pub use coordinator::{ClaimResult, Coordinator};
pub use error::{Error, Result};
pub use protocol::{ClaimReply, ClientRequest, ReplyStatus, ServerMessage, SnapshotMessage};
pub use registry::{BroadcastReport, ObserverId, ObserverInbox, ObserverRegistry, ReplyPermit};
pub use server::SlotServer;
pub use session::{CloseReason, SessionState, SessionSummary};
