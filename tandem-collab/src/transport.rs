//! WebSocket transport with supervised reconnection.
//!
//! One supervisor task owns the connection for its whole life:
//!
//! ```text
//!        connect()
//!            │
//!            ▼
//!    ┌─▶ Connecting ──dial ok──▶ Connected
//!    │       │                      │
//! backoff  dial failed        connection lost
//!    │       │                      │
//!    └───────┴◀─────────────────────┘
//!            │
//!   attempts exhausted
//!            ▼
//!          Failed   (terminal)
//! ```
//!
//! Outbound frames travel over an mpsc channel into the supervisor;
//! inbound frames are decoded and surfaced as [`SyncEvent`]s. Callers
//! never touch the socket. Operations are not queued here while
//! offline: the session's pending list is the durable record and is
//! replayed when a `Status(Connected)` event arrives.
//!
//! Reference: Kleppmann, Chapter 5 (Replication)

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_ot::Operation;

use crate::presence::CursorPosition;
use crate::protocol::{
    CommentNotice, FileSnapshot, MessageType, Participant, ProtocolError, SyncMessage,
};

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    /// Reconnect attempts exhausted. Terminal.
    Failed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Failed,
            _ => Self::Disconnected,
        }
    }
}

/// Backoff schedule for reconnection.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry `attempt` (1-based): the base delay doubling
    /// per attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        Duration::from_millis(base_ms.saturating_mul(1u64 << exp).min(max_ms))
    }
}

/// Events emitted by the transport.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection state changed
    Status(ConnectionState),
    /// A reconciled operation relayed by the server
    Operation { file_id: Uuid, op: Operation },
    /// The server applied one of our operations
    OperationAck(Uuid),
    /// A remote cursor moved
    Cursor(CursorPosition),
    /// Authoritative snapshot of a file
    FileChanged(FileSnapshot),
    /// A comment was posted somewhere in the project
    CommentAdded(CommentNotice),
    /// Someone joined the project room
    ParticipantJoined(Participant),
    /// Someone left the project room
    ParticipantLeft(Uuid),
}

/// Client half of the sync protocol.
///
/// Dials `ws://{server_url}/{project_id}`, announces the local
/// participant, then keeps the link alive per its [`ReconnectPolicy`].
pub struct SyncTransport {
    local: Participant,
    project_id: Uuid,
    server_url: String,
    policy: ReconnectPolicy,
    state: Arc<AtomicU8>,
    out_tx: mpsc::Sender<Vec<u8>>,
    out_rx: Option<mpsc::Receiver<Vec<u8>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    supervisor: Option<JoinHandle<()>>,
}

impl SyncTransport {
    pub fn new(
        server_url: impl Into<String>,
        project_id: Uuid,
        local: Participant,
        policy: ReconnectPolicy,
    ) -> Self {
        let (out_tx, out_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            local,
            project_id,
            server_url: server_url.into(),
            policy,
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
            out_tx,
            out_rx: Some(out_rx),
            event_tx,
            event_rx: Some(event_rx),
            supervisor: None,
        }
    }

    /// Spawn the connection supervisor. Must be called from within a
    /// tokio runtime. A second call is a no-op; a transport that has
    /// reached `Failed` stays failed, open a fresh one to start over.
    pub fn connect(&mut self) {
        let Some(out_rx) = self.out_rx.take() else {
            log::debug!("transport supervisor already started");
            return;
        };
        let handle = tokio::spawn(run_supervisor(
            self.server_url.clone(),
            self.project_id,
            self.local.clone(),
            self.policy,
            self.state.clone(),
            out_rx,
            self.event_tx.clone(),
        ));
        self.supervisor = Some(handle);
    }

    /// Hand an operation to the writer. A silent no-op while offline;
    /// the caller's pending queue is the durable record and is flushed
    /// after reconnect.
    pub fn send_operation(&self, file_id: Uuid, op: &Operation) {
        if self.state() != ConnectionState::Connected {
            log::trace!("offline, operation {} stays pending", op.id);
            return;
        }
        let msg = SyncMessage::operation(self.local.user_id, self.project_id, file_id, op);
        match msg.encode() {
            Ok(encoded) => {
                if self.out_tx.try_send(encoded).is_err() {
                    log::warn!("outgoing channel full, operation {} left to replay", op.id);
                }
            }
            Err(e) => log::error!("encoding operation failed: {e}"),
        }
    }

    /// Best-effort cursor broadcast. Dropped silently when offline or
    /// when the writer is saturated; a stale cursor is worse than a
    /// missing one.
    pub fn send_cursor(&self, position: &CursorPosition) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let msg = SyncMessage::cursor(self.local.user_id, self.project_id, position);
        if let Ok(encoded) = msg.encode() {
            let _ = self.out_tx.try_send(encoded);
        }
    }

    /// Post a comment notification to the room.
    pub fn send_comment(&self, notice: &CommentNotice) -> Result<(), ProtocolError> {
        if self.state() != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let msg = SyncMessage::comment_added(self.local.user_id, self.project_id, notice);
        let encoded = msg.encode()?;
        self.out_tx
            .try_send(encoded)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Application-level liveness probe.
    pub fn send_ping(&self) -> Result<(), ProtocolError> {
        if self.state() != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let msg = SyncMessage::ping(self.local.user_id);
        let encoded = msg.encode()?;
        self.out_tx
            .try_send(encoded)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Take the inbound event receiver; a second call returns `None`.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Abort the supervisor and drop the socket.
    pub fn close(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Drop for SyncTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

async fn publish_state(
    state: &AtomicU8,
    event_tx: &mpsc::Sender<SyncEvent>,
    next: ConnectionState,
) {
    state.store(next as u8, Ordering::SeqCst);
    let _ = event_tx.send(SyncEvent::Status(next)).await;
}

/// Owns the connection: dial, announce, pump, and re-dial on loss.
async fn run_supervisor(
    server_url: String,
    project_id: Uuid,
    local: Participant,
    policy: ReconnectPolicy,
    state: Arc<AtomicU8>,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    event_tx: mpsc::Sender<SyncEvent>,
) {
    let url = format!("{server_url}/{project_id}");
    let mut attempt: u32 = 0;

    loop {
        publish_state(&state, &event_tx, ConnectionState::Connecting).await;

        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                attempt = 0;

                // Frames addressed to the dead connection are stale.
                while out_rx.try_recv().is_ok() {}

                let (mut writer, mut reader) = ws_stream.split();

                let announce = SyncMessage::user_joined(local.user_id, project_id, &local);
                let announced = match announce.encode() {
                    Ok(encoded) => writer.send(Message::Binary(encoded.into())).await.is_ok(),
                    Err(e) => {
                        log::error!("encoding join announcement failed: {e}");
                        false
                    }
                };

                if announced {
                    log::info!("connected to {url} as {}", local.name);
                    publish_state(&state, &event_tx, ConnectionState::Connected).await;

                    let keep_running =
                        pump(&mut writer, &mut reader, &mut out_rx, &event_tx).await;

                    log::info!("connection to {url} closed");
                    publish_state(&state, &event_tx, ConnectionState::Disconnected).await;
                    if !keep_running {
                        return;
                    }
                } else {
                    publish_state(&state, &event_tx, ConnectionState::Disconnected).await;
                }
            }
            Err(e) => {
                log::debug!("dial {url} failed: {e}");
                publish_state(&state, &event_tx, ConnectionState::Disconnected).await;
            }
        }

        attempt += 1;
        if attempt >= policy.max_attempts {
            log::error!("giving up on {url} after {attempt} attempts");
            publish_state(&state, &event_tx, ConnectionState::Failed).await;
            return;
        }
        tokio::time::sleep(policy.delay_for(attempt)).await;
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Pump frames both ways until the connection drops. Returns false
/// when the outgoing channel has closed and the supervisor should
/// stop for good.
async fn pump(
    writer: &mut futures_util::stream::SplitSink<WsStream, Message>,
    reader: &mut futures_util::stream::SplitStream<WsStream>,
    out_rx: &mut mpsc::Receiver<Vec<u8>>,
    event_tx: &mpsc::Sender<SyncEvent>,
) -> bool {
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if writer.send(Message::Binary(frame.into())).await.is_err() {
                            return true;
                        }
                    }
                    None => {
                        // Transport handle dropped: clean shutdown.
                        let _ = writer.send(Message::Close(None)).await;
                        return false;
                    }
                }
            }
            inbound = reader.next() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        dispatch(&bytes, event_tx).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if writer.send(Message::Pong(payload)).await.is_err() {
                            return true;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return true,
                    Some(Err(e)) => {
                        log::debug!("websocket read error: {e}");
                        return true;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Decode one inbound frame and surface it as a [`SyncEvent`].
/// Malformed frames are logged and discarded, never fatal.
async fn dispatch(bytes: &[u8], event_tx: &mpsc::Sender<SyncEvent>) {
    let msg = match SyncMessage::decode(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("discarding malformed frame: {e}");
            return;
        }
    };

    let event = match msg.msg_type {
        MessageType::Operation => match msg.operation_payload() {
            Ok(op) => Some(SyncEvent::Operation {
                file_id: msg.file_id,
                op,
            }),
            Err(e) => {
                log::warn!("discarding operation frame: {e}");
                None
            }
        },
        MessageType::OperationAck => match msg.ack_id() {
            Ok(op_id) => Some(SyncEvent::OperationAck(op_id)),
            Err(e) => {
                log::warn!("discarding ack frame: {e}");
                None
            }
        },
        MessageType::CursorPosition => msg.cursor_payload().ok().map(SyncEvent::Cursor),
        MessageType::FileChange => msg.file_snapshot().ok().map(SyncEvent::FileChanged),
        MessageType::CommentAdded => msg.comment().ok().map(SyncEvent::CommentAdded),
        MessageType::UserJoined => msg.participant().ok().map(SyncEvent::ParticipantJoined),
        MessageType::UserLeft => Some(SyncEvent::ParticipantLeft(msg.sender)),
        MessageType::Ping | MessageType::Pong => None,
    };

    if let Some(event) = event {
        let _ = event_tx.send(event).await;
    }
}
