//! In-memory observer harness.
//!
//! Runs real server sessions over channel-backed transports so scenarios can
//! script several observers against one coordinator without sockets.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use slotgrid_server::{
    session, ClaimReply, Coordinator, ServerConfig, ServerMessage, SessionSummary, SnapshotMessage,
};
use tokio::task::JoinHandle;

/// How long a harness call waits for a frame before failing.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A coordinator over the default 5×5 grid.
pub fn coordinator() -> Arc<Coordinator> {
    coordinator_with(ServerConfig::default())
}

pub fn coordinator_with(config: ServerConfig) -> Arc<Coordinator> {
    Arc::new(Coordinator::new(config).expect("valid test config"))
}

/// One scripted observer connected through an in-memory transport.
pub struct TestObserver {
    name: String,
    inbound: UnboundedSender<Result<Message, io::Error>>,
    outbound: UnboundedReceiver<Message>,
    session: JoinHandle<SessionSummary>,
}

impl TestObserver {
    /// Connect a new observer; its session runs on its own task.
    pub fn connect(coordinator: &Arc<Coordinator>, name: &str) -> Self {
        let (inbound, reader) = unbounded();
        let (writer, outbound) = unbounded();
        let session = tokio::spawn(session::run(Arc::clone(coordinator), reader, writer));
        Self {
            name: name.to_string(),
            inbound,
            outbound,
            session,
        }
    }

    /// Connect and consume the initial snapshot.
    pub async fn connect_ready(
        coordinator: &Arc<Coordinator>,
        name: &str,
    ) -> (Self, SnapshotMessage) {
        let mut observer = Self::connect(coordinator, name);
        let initial = observer.recv_snapshot().await;
        (observer, initial)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a raw text frame.
    pub fn send_text(&self, text: &str) {
        self.inbound
            .unbounded_send(Ok(Message::Text(text.to_string().into())))
            .expect("session reader is gone");
    }

    /// Request `ticket_id` under this observer's name.
    pub fn book(&self, ticket_id: &str) {
        let request = serde_json::json!({
            "action": "book",
            "ticket_id": ticket_id,
            "client_name": self.name,
        });
        self.send_text(&request.to_string());
    }

    /// Close the transport from the peer side.
    pub fn close(&self) {
        let _ = self.inbound.unbounded_send(Ok(Message::Close(None)));
    }

    /// Next server message.
    pub async fn recv(&mut self) -> ServerMessage {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.outbound.next())
            .await
            .unwrap_or_else(|_| panic!("{}: timed out waiting for a frame", self.name))
            .unwrap_or_else(|| panic!("{}: transport closed", self.name));
        match frame {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("valid server JSON"),
            other => panic!("{}: unexpected frame {:?}", self.name, other),
        }
    }

    pub async fn recv_snapshot(&mut self) -> SnapshotMessage {
        match self.recv().await {
            ServerMessage::Snapshot(snapshot) => snapshot,
            other => panic!("{}: expected snapshot, got {:?}", self.name, other),
        }
    }

    pub async fn recv_reply(&mut self) -> ClaimReply {
        match self.recv().await {
            ServerMessage::Reply(reply) => reply,
            other => panic!("{}: expected reply, got {:?}", self.name, other),
        }
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(frame) = tokio::time::timeout(wait, self.outbound.next()).await {
            panic!("{}: expected silence, got {:?}", self.name, frame);
        }
    }

    /// Wait for the session task to end.
    pub async fn finish(self) -> SessionSummary {
        tokio::time::timeout(RECV_TIMEOUT, self.session)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }
}
