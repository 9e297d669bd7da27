//! Per-connection observer session.
//!
//! A session moves through `Connecting → Active → Closed`:
//!
//! - **Connecting**: the observer is registered and its snapshot cell is
//!   seeded with the current table before any inbound frame is read.
//! - **Active**: a writer task drains the observer's replies and snapshots
//!   into the transport while the reader loop dispatches inbound frames.
//! - **Closed**: the observer has left the active set and the writer task is
//!   gone.
//!
//! Sessions are generic over the transport halves so the same code runs on
//! an upgraded WebSocket and on in-memory channels.

use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::config::MalformedPolicy;
use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::protocol::{
    decode_request, decode_request_bytes, ClaimReply, ClientRequest, ServerMessage,
    SnapshotMessage,
};
use crate::registry::ObserverId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent Close or its stream ended.
    PeerClosed,
    /// Reading from or writing to the transport failed.
    Transport(String),
    /// A malformed message arrived under [`MalformedPolicy::Disconnect`].
    Malformed(String),
    /// The observer was disconnected.
    Stopped,
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::Malformed(e) => write!(f, "malformed message: {}", e),
            CloseReason::Stopped => write!(f, "stopped"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Summary returned when a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// `None` when the session was refused before registration.
    pub observer: Option<ObserverId>,
    pub state: SessionState,
    pub reason: CloseReason,
    /// Requests that decoded and were applied.
    pub requests: usize,
}

/// Removes the observer from the active set however the session ends,
/// including when the session future is dropped mid-await.
struct ObserverGuard {
    coordinator: Arc<Coordinator>,
    id: ObserverId,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.coordinator.leave(self.id);
    }
}

enum Flow {
    Continue,
    Close(CloseReason),
}

/// Run one observer session until it closes.
pub async fn run<R, W, E>(coordinator: Arc<Coordinator>, mut reader: R, writer: W) -> SessionSummary
where
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: fmt::Display + Send,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display + Send,
{
    let mut state = SessionState::Connecting;

    let mut shutdown = coordinator.shutdown_signal();
    if *shutdown.borrow() {
        debug!("Refusing connection during shutdown");
        return SessionSummary {
            observer: None,
            state: SessionState::Closed,
            reason: CloseReason::Shutdown,
            requests: 0,
        };
    }

    let inbox = coordinator.join();
    let id = inbox.id;
    let guard = ObserverGuard {
        coordinator: Arc::clone(&coordinator),
        id,
    };
    let stop = Arc::clone(&inbox.stop);
    let mut writer_task = tokio::spawn(write_loop(id, inbox.replies, inbox.snapshots, writer));

    debug!("{}: {:?} -> {:?}", id, state, SessionState::Active);
    state = SessionState::Active;
    info!("{} connected ({} active)", id, coordinator.observers().len());

    let mut requests = 0;
    let reason = loop {
        let message = tokio::select! {
            _ = stop.notified() => break CloseReason::Stopped,
            _ = shutdown.wait_for(|stopping| *stopping) => break CloseReason::Shutdown,
            finished = &mut writer_task => break writer_closed(finished),
            frame = reader.next() => match frame {
                None => break CloseReason::PeerClosed,
                Some(Err(e)) => break CloseReason::Transport(e.to_string()),
                Some(Ok(message)) => message,
            },
        };

        // A claim may wait for room in this observer's reply queue; stay stoppable.
        let flow = tokio::select! {
            flow = handle_frame(&coordinator, id, message, &mut requests) => flow,
            _ = stop.notified() => Flow::Close(CloseReason::Stopped),
            _ = shutdown.wait_for(|stopping| *stopping) => Flow::Close(CloseReason::Shutdown),
        };
        if let Flow::Close(reason) = flow {
            break reason;
        }
    };

    // Leave the active set before anything else happens to this connection.
    drop(guard);
    writer_task.abort();

    debug!("{}: {:?} -> {:?}", id, state, SessionState::Closed);
    info!("A client disconnected: {} ({})", id, reason);

    SessionSummary {
        observer: Some(id),
        state: SessionState::Closed,
        reason,
        requests,
    }
}

fn writer_closed(finished: Result<Result<(), Error>, JoinError>) -> CloseReason {
    match finished {
        Ok(Ok(())) => CloseReason::Stopped,
        Ok(Err(e)) => CloseReason::Transport(e.to_string()),
        Err(e) => CloseReason::Transport(e.to_string()),
    }
}

async fn handle_frame(
    coordinator: &Coordinator,
    id: ObserverId,
    message: Message,
    requests: &mut usize,
) -> Flow {
    let decoded = match message {
        Message::Text(text) => decode_request(text.as_str()),
        Message::Binary(bytes) => decode_request_bytes(&bytes),
        Message::Close(_) => return Flow::Close(CloseReason::PeerClosed),
        // Ping/Pong are answered by the transport
        _ => return Flow::Continue,
    };

    match decoded {
        Ok(request) => {
            dispatch(coordinator, id, request).await;
            *requests += 1;
            Flow::Continue
        }
        Err(e) => on_malformed(coordinator, id, e).await,
    }
}

async fn dispatch(coordinator: &Coordinator, id: ObserverId, request: ClientRequest) {
    debug!("{}: {:?}", id, request);
    coordinator.handle(id, request).await;
}

async fn on_malformed(coordinator: &Coordinator, id: ObserverId, error: Error) -> Flow {
    let detail = match error {
        Error::Decode(detail) => detail,
        other => other.to_string(),
    };

    match coordinator.config().malformed {
        MalformedPolicy::Ignore => {
            warn!("{}: ignoring malformed message: {}", id, detail);
            Flow::Continue
        }
        MalformedPolicy::Reply => {
            warn!("{}: malformed message: {}", id, detail);
            coordinator.reply(id, ClaimReply::malformed(&detail)).await;
            Flow::Continue
        }
        MalformedPolicy::Disconnect => {
            warn!("{}: malformed message, closing: {}", id, detail);
            Flow::Close(CloseReason::Malformed(detail))
        }
    }
}

/// Drain the observer's replies and snapshots into the transport.
///
/// The initial snapshot goes out first. After that queued replies win over a
/// pending snapshot, so a requester always sees its reply before the
/// broadcast its claim triggered. Returns `Ok(())` once the observer was
/// removed and `Err` on the first failed write.
async fn write_loop<W>(
    id: ObserverId,
    mut replies: mpsc::Receiver<ClaimReply>,
    mut snapshots: watch::Receiver<Option<SnapshotMessage>>,
    mut writer: W,
) -> Result<(), Error>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let initial = snapshots.borrow_and_update().clone();
    if let Some(snapshot) = initial {
        send(id, &mut writer, ServerMessage::Snapshot(snapshot)).await?;
    }

    loop {
        let message = tokio::select! {
            biased;
            reply = replies.recv() => match reply {
                Some(reply) => ServerMessage::Reply(reply),
                None => break,
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = snapshots.borrow_and_update().clone();
                match latest {
                    Some(snapshot) => ServerMessage::Snapshot(snapshot),
                    None => continue,
                }
            }
        };
        send(id, &mut writer, message).await?;
    }

    let _ = writer.close().await;
    Ok(())
}

async fn send<W>(id: ObserverId, writer: &mut W, message: ServerMessage) -> Result<(), Error>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("{}: failed to encode message: {}", id, e);
            return Ok(());
        }
    };
    writer.send(Message::Text(json.into())).await.map_err(|e| {
        debug!("{}: write failed: {}", id, e);
        Error::Transport(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use std::io;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    type Inbound = UnboundedSender<Result<Message, io::Error>>;

    struct Peer {
        inbound: Inbound,
        outbound: UnboundedReceiver<Message>,
        session: JoinHandle<SessionSummary>,
    }

    fn connect(coordinator: &Arc<Coordinator>) -> Peer {
        let (inbound, reader) = unbounded();
        let (writer, outbound) = unbounded();
        let session = tokio::spawn(run(Arc::clone(coordinator), reader, writer));
        Peer {
            inbound,
            outbound,
            session,
        }
    }

    impl Peer {
        fn send_text(&self, text: &str) {
            self.inbound
                .unbounded_send(Ok(Message::Text(text.to_string().into())))
                .unwrap();
        }

        async fn recv(&mut self) -> ServerMessage {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.outbound.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("session closed the transport");
            match frame {
                Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("unexpected frame {:?}", other),
            }
        }

        async fn finish(self) -> SessionSummary {
            tokio::time::timeout(Duration::from_secs(2), self.session)
                .await
                .expect("session did not end")
                .unwrap()
        }
    }

    fn coordinator_with(malformed: MalformedPolicy) -> Arc<Coordinator> {
        Arc::new(
            Coordinator::new(ServerConfig {
                malformed,
                ..ServerConfig::default()
            })
            .unwrap(),
        )
    }

    const BOOK_0_0: &str = r#"{"action":"book","ticket_id":"ticket_0_0","client_name":"A"}"#;

    #[tokio::test]
    async fn initial_snapshot_precedes_everything() {
        let coordinator = coordinator_with(MalformedPolicy::Ignore);
        let mut peer = connect(&coordinator);

        match peer.recv().await {
            ServerMessage::Snapshot(s) => {
                assert_eq!(s.tickets.len(), 25);
                assert!(s.tickets.values().all(|b| !b));
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
        assert_eq!(coordinator.observers().len(), 1);
    }

    #[tokio::test]
    async fn book_gets_reply_and_broadcast() {
        let coordinator = coordinator_with(MalformedPolicy::Ignore);
        let mut peer = connect(&coordinator);
        peer.recv().await;

        peer.send_text(BOOK_0_0);

        assert!(matches!(peer.recv().await, ServerMessage::Reply(r) if r.is_success()));
        assert!(matches!(peer.recv().await, ServerMessage::Snapshot(s) if s.version == 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pipelined_requests_are_all_answered() {
        let coordinator = Arc::new(
            Coordinator::new(ServerConfig {
                outbound_buffer: 1,
                ..ServerConfig::default()
            })
            .unwrap(),
        );
        let mut peer = connect(&coordinator);
        peer.recv().await;
        let ids: Vec<String> = coordinator.table().ids().map(|id| id.to_string()).collect();

        // every slot twice, without waiting for any answer
        for _ in 0..2 {
            for id in &ids {
                peer.send_text(&format!(
                    r#"{{"action":"book","ticket_id":"{}","client_name":"A"}}"#,
                    id
                ));
            }
        }

        let mut successes = 0;
        let mut replies = 0;
        let mut last_version = 0;
        while replies < 2 * ids.len() || last_version < ids.len() as u64 {
            match peer.recv().await {
                ServerMessage::Reply(reply) => {
                    replies += 1;
                    if reply.is_success() {
                        successes += 1;
                    }
                }
                ServerMessage::Snapshot(s) => {
                    assert!(s.version > last_version);
                    last_version = s.version;
                }
            }
        }

        assert_eq!(successes, ids.len());
        assert_eq!(coordinator.observers().len(), 1);
    }

    #[tokio::test]
    async fn peer_close_removes_observer() {
        let coordinator = coordinator_with(MalformedPolicy::Ignore);
        let mut peer = connect(&coordinator);
        peer.recv().await;

        peer.inbound.unbounded_send(Ok(Message::Close(None))).unwrap();
        let summary = peer.finish().await;

        assert_eq!(summary.reason, CloseReason::PeerClosed);
        assert_eq!(summary.state, SessionState::Closed);
        assert!(coordinator.observers().is_empty());
    }

    #[tokio::test]
    async fn dropped_stream_removes_observer() {
        let coordinator = coordinator_with(MalformedPolicy::Ignore);
        let mut peer = connect(&coordinator);
        peer.recv().await;

        peer.inbound.close_channel();
        let summary = peer.finish().await;

        assert_eq!(summary.reason, CloseReason::PeerClosed);
        assert!(coordinator.observers().is_empty());
    }

    #[tokio::test]
    async fn transport_error_removes_observer() {
        let coordinator = coordinator_with(MalformedPolicy::Ignore);
        let mut peer = connect(&coordinator);
        peer.recv().await;

        peer.inbound
            .unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();
        let summary = peer.finish().await;

        assert!(matches!(summary.reason, CloseReason::Transport(_)));
        assert!(coordinator.observers().is_empty());
    }

    #[tokio::test]
    async fn ignore_policy_keeps_session_silent() {
        let coordinator = coordinator_with(MalformedPolicy::Ignore);
        let mut peer = connect(&coordinator);
        peer.recv().await;

        peer.send_text("{not json");
        peer.send_text(BOOK_0_0);

        // the next frame is the reply to the valid request, nothing for the bad one
        assert!(matches!(peer.recv().await, ServerMessage::Reply(r) if r.is_success()));
    }

    #[tokio::test]
    async fn reply_policy_answers_with_error() {
        let coordinator = coordinator_with(MalformedPolicy::Reply);
        let mut peer = connect(&coordinator);
        peer.recv().await;

        peer.send_text(r#"{"action":"cancel"}"#);

        match peer.recv().await {
            ServerMessage::Reply(r) => {
                assert!(!r.is_success());
                assert!(r.message.starts_with("Malformed request:"));
            }
            other => panic!("expected reply, got {:?}", other),
        }
        assert_eq!(coordinator.observers().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_policy_closes_session() {
        let coordinator = coordinator_with(MalformedPolicy::Disconnect);
        let mut peer = connect(&coordinator);
        peer.recv().await;

        peer.send_text("garbage");
        let summary = peer.finish().await;

        assert!(matches!(summary.reason, CloseReason::Malformed(_)));
        assert_eq!(summary.requests, 0);
        assert!(coordinator.observers().is_empty());
    }

    #[tokio::test]
    async fn forced_disconnect_does_not_wait_for_peer() {
        let coordinator = coordinator_with(MalformedPolicy::Ignore);
        let mut peer = connect(&coordinator);
        peer.recv().await;
        let id = coordinator.observers().ids()[0];

        // the peer never sends anything; the session must still end
        assert!(coordinator.disconnect(id));
        let summary = peer.finish().await;

        assert_eq!(summary.reason, CloseReason::Stopped);
        assert_eq!(summary.observer, Some(id));
        assert!(!coordinator.observers().contains(id));
    }

    #[tokio::test]
    async fn shutdown_ends_sessions_and_refuses_new_ones() {
        let coordinator = coordinator_with(MalformedPolicy::Ignore);
        let mut peer = connect(&coordinator);
        peer.recv().await;

        coordinator.shutdown();
        let summary = peer.finish().await;
        assert!(matches!(
            summary.reason,
            CloseReason::Shutdown | CloseReason::Stopped
        ));

        let late = connect(&coordinator);
        let summary = late.finish().await;
        assert_eq!(summary.observer, None);
        assert_eq!(summary.reason, CloseReason::Shutdown);
        assert!(coordinator.observers().is_empty());
    }

    #[tokio::test]
    async fn aborted_session_still_leaves_active_set() {
        let coordinator = coordinator_with(MalformedPolicy::Ignore);
        let mut peer = connect(&coordinator);
        peer.recv().await;
        assert_eq!(coordinator.observers().len(), 1);

        peer.session.abort();
        let _ = peer.session.await;

        assert!(coordinator.observers().is_empty());
    }

    #[tokio::test]
    async fn failed_write_closes_session() {
        let coordinator = coordinator_with(MalformedPolicy::Ignore);
        let mut peer = connect(&coordinator);
        peer.recv().await;

        // peer stops reading: writes now fail
        drop(peer.outbound);
        peer.inbound
            .unbounded_send(Ok(Message::Text(BOOK_0_0.to_string().into())))
            .unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), peer.session)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(summary.reason, CloseReason::Transport(_)));
        assert_eq!(summary.requests, 1);
        assert!(coordinator.observers().is_empty());
    }
}
