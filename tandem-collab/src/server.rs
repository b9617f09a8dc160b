//! WebSocket sync server with project-room routing.
//!
//! The moving parts:
//! ```text
//! editor A ──┐
//!            ├── ProjectRoom ── FileState (buffer, revision, history)
//! editor B ──┘       │
//!                    ├── BroadcastGroup ──▶ fan-out to room members
//!                    │
//!                    └── DocumentPersistence (load on first touch,
//!                                             save on room close)
//! ```
//!
//! Each project room holds one authoritative [`FileState`] per open
//! file. An inbound operation is reconciled in three steps: duplicates
//! are dropped by id (a replay after reconnect is re-acked, never
//! re-applied), the operation is transformed over the foreign history
//! it has not yet seen, and the result is applied, recorded, broadcast
//! to the room, and acked to its author in stream order. Cursor,
//! file-change and comment frames are relayed untouched.
//!
//! Reference: Kleppmann, Chapters 8 & 9 (The Trouble with Distributed
//! Systems; Consistency and Consensus)

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_ot::{apply, transform, Operation};

use crate::broadcast::BroadcastGroup;
use crate::persist::{DocumentPersistence, PersistError};
use crate::protocol::{FileSnapshot, MessageType, Participant, SyncMessage};

/// Operations kept per file for transforming late arrivals. An op
/// issued against a revision older than the window's edge gets a
/// snapshot instead of an ack.
const HISTORY_WINDOW: usize = 1024;

/// Knobs for [`SyncServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub bind_addr: String,
    /// Cap on members per project room
    pub max_peers_per_room: usize,
    /// Frames buffered per room receiver
    pub broadcast_capacity: usize,
    /// Seconds between keep-alive pings
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Counters exposed by [`SyncServer::stats`].
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub operations_applied: u64,
    pub operations_deduped: u64,
}

/// Outcome of reconciling one inbound operation.
enum Reconciled {
    /// Transformed into server context and applied; broadcast this.
    Applied(Operation),
    /// Already applied earlier; re-ack this id, do not re-apply.
    Duplicate(Uuid),
    /// Issued against a revision the history window no longer covers.
    BaseTooOld,
}

/// Authoritative state of one file.
///
/// `history` holds the ops as applied, in order. Per-author apply
/// counts let the walk skip the author's own entries: an operation's
/// issue revision already accounts for them through the acks the
/// author consumed, so transforming against them would double-count.
struct FileState {
    buffer: String,
    revision: u64,
    /// Revision this room first saw the file at. Nothing before it
    /// can be transformed.
    base_revision: u64,
    history: VecDeque<Operation>,
    applied_ids: HashSet<Uuid>,
    applied_by_author: HashMap<Uuid, u64>,
    trimmed_total: u64,
    trimmed_by_author: HashMap<Uuid, u64>,
    window: usize,
}

impl FileState {
    fn new(content: impl Into<String>, revision: u64) -> Self {
        Self::with_window(content, revision, HISTORY_WINDOW)
    }

    fn with_window(content: impl Into<String>, revision: u64, window: usize) -> Self {
        Self {
            buffer: content.into(),
            revision,
            base_revision: revision,
            history: VecDeque::new(),
            applied_ids: HashSet::new(),
            applied_by_author: HashMap::new(),
            trimmed_total: 0,
            trimmed_by_author: HashMap::new(),
            window,
        }
    }

    /// Bring one inbound operation into server context and apply it.
    fn reconcile(&mut self, op: Operation) -> Reconciled {
        if self.applied_ids.contains(&op.id) {
            return Reconciled::Duplicate(op.id);
        }

        let own = self.applied_by_author.get(&op.author).copied().unwrap_or(0);
        if op.revision < self.base_revision.saturating_add(own) {
            // Issued against a copy older than this room has ever seen.
            return Reconciled::BaseTooOld;
        }
        let seen_foreign = op
            .revision
            .saturating_sub(self.base_revision.saturating_add(own));

        let trimmed_foreign = self.trimmed_total.saturating_sub(
            self.trimmed_by_author
                .get(&op.author)
                .copied()
                .unwrap_or(0),
        );
        if seen_foreign < trimmed_foreign {
            return Reconciled::BaseTooOld;
        }
        let mut to_skip = seen_foreign - trimmed_foreign;

        let mut incoming = op;
        for past in &self.history {
            if past.author == incoming.author {
                continue;
            }
            if to_skip > 0 {
                to_skip -= 1;
                continue;
            }
            incoming = transform(past, &incoming).1;
        }

        self.buffer = apply(&self.buffer, &incoming);
        self.revision += 1;
        self.applied_ids.insert(incoming.id);
        *self.applied_by_author.entry(incoming.author).or_insert(0) += 1;
        self.history.push_back(incoming.clone());

        while self.history.len() > self.window {
            if let Some(old) = self.history.pop_front() {
                self.trimmed_total += 1;
                *self.trimmed_by_author.entry(old.author).or_insert(0) += 1;
                self.applied_ids.remove(&old.id);
            }
        }

        Reconciled::Applied(incoming)
    }

    /// Current state as a wire snapshot. Rooms track content, not
    /// names, so the name stays blank.
    fn snapshot(&self, file_id: Uuid) -> FileSnapshot {
        FileSnapshot {
            file_id,
            name: String::new(),
            content: self.buffer.clone(),
            revision: self.revision,
            updated_at: unix_millis(),
        }
    }
}

/// Project room: per-file authoritative state + broadcast group.
struct ProjectRoom {
    broadcast: Arc<BroadcastGroup>,
    files: HashMap<Uuid, FileState>,
}

impl ProjectRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            files: HashMap::new(),
        }
    }
}

type ServerSink =
    futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>;

/// Encode and write one frame. False when the socket is gone.
async fn send_frame(sink: &mut ServerSink, msg: &SyncMessage) -> bool {
    match msg.encode() {
        Ok(encoded) => sink.send(Message::Binary(encoded.into())).await.is_ok(),
        Err(e) => {
            log::error!("encoding outbound frame failed: {e}");
            true
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// WebSocket server coordinating project rooms.
pub struct SyncServer {
    config: ServerConfig,
    /// project_id → (files + broadcast group)
    rooms: Arc<RwLock<HashMap<Uuid, ProjectRoom>>>,
    /// Shared counters
    stats: Arc<RwLock<ServerStats>>,
    /// Storage for room state (None: rooms live and die in memory)
    persistence: Option<Arc<dyn DocumentPersistence>>,
}

impl SyncServer {
    /// Build a server from `config`; rooms live purely in memory.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            persistence: None,
        }
    }

    /// Create with default configuration, in-memory only.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with a persistence backend. Rooms load a file's
    /// authoritative copy on first touch and save on room close.
    pub fn with_persistence(config: ServerConfig, persistence: Arc<dyn DocumentPersistence>) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::new(config)
        }
    }

    /// Bind the listen address and accept connections until the
    /// enclosing task is dropped. Each accepted socket gets its own
    /// task.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let persistence = self.persistence.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, rooms, stats, config, persistence).await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Drive one client connection from handshake to cleanup.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RwLock<HashMap<Uuid, ProjectRoom>>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        persistence: Option<Arc<dyn DocumentPersistence>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("websocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Filled in once the client announces itself with user_joined.
        let mut user_id: Option<Uuid> = None;
        let mut project_id: Option<Uuid> = None;
        let mut group: Option<Arc<BroadcastGroup>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        // The first tick completes immediately; consume it.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                // Frame arriving from this client's socket
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match SyncMessage::decode(&bytes) {
                                Ok(sync_msg) => {
                                    {
                                        let mut s = stats.write().await;
                                        s.total_messages += 1;
                                        s.total_bytes += bytes.len() as u64;
                                    }

                                    match sync_msg.msg_type {
                                        MessageType::UserJoined => {
                                            let joining = sync_msg.participant().unwrap_or_else(|_| {
                                                Participant::with_id(sync_msg.sender, "Anonymous")
                                            });

                                            let mut rooms_w = rooms.write().await;
                                            let room = rooms_w
                                                .entry(sync_msg.project_id)
                                                .or_insert_with(|| ProjectRoom::new(config.broadcast_capacity));

                                            if room.broadcast.peer_count().await >= config.max_peers_per_room {
                                                drop(rooms_w);
                                                log::warn!(
                                                    "project {} is full, refusing {}",
                                                    sync_msg.project_id,
                                                    joining.name
                                                );
                                                let _ = ws_sender.send(Message::Close(None)).await;
                                                break;
                                            }

                                            user_id = Some(sync_msg.sender);
                                            project_id = Some(sync_msg.project_id);

                                            let rx = room.broadcast.add_peer(joining.clone()).await;
                                            broadcast_rx = Some(rx);
                                            group = Some(room.broadcast.clone());

                                            // Late joiners get the current state of every open file.
                                            let snapshots: Vec<SyncMessage> = room
                                                .files
                                                .iter()
                                                .map(|(fid, state)| {
                                                    SyncMessage::file_change(sync_msg.project_id, &state.snapshot(*fid))
                                                })
                                                .collect();

                                            let join_msg = SyncMessage::user_joined(
                                                joining.user_id,
                                                sync_msg.project_id,
                                                &joining,
                                            );
                                            let room_count = rooms_w.len();
                                            drop(rooms_w); // The sends below must not hold the room lock.

                                            let mut socket_dead = false;
                                            for snapshot_msg in &snapshots {
                                                if !send_frame(&mut ws_sender, snapshot_msg).await {
                                                    socket_dead = true;
                                                    break;
                                                }
                                            }
                                            if socket_dead {
                                                break;
                                            }

                                            if let Some(ref g) = group {
                                                let _ = g.broadcast(&join_msg);
                                            }

                                            {
                                                let mut s = stats.write().await;
                                                s.active_rooms = room_count;
                                            }

                                            log::info!(
                                                "{} ({}) joined project {}",
                                                joining.name,
                                                joining.user_id,
                                                sync_msg.project_id
                                            );
                                        }

                                        MessageType::Operation => {
                                            if let (Some(author), Some(pid)) = (user_id, project_id) {
                                                match sync_msg.operation_payload() {
                                                    Ok(op) => {
                                                        let done = Self::handle_operation(
                                                            &mut ws_sender,
                                                            &mut broadcast_rx,
                                                            &rooms,
                                                            &stats,
                                                            group.as_ref(),
                                                            persistence.as_ref(),
                                                            author,
                                                            pid,
                                                            sync_msg.file_id,
                                                            op,
                                                            addr,
                                                        )
                                                        .await;
                                                        if done {
                                                            break;
                                                        }
                                                    }
                                                    Err(e) => {
                                                        log::warn!("discarding malformed operation from {addr}: {e}");
                                                    }
                                                }
                                            } else {
                                                log::debug!("operation from {addr} before join");
                                            }
                                        }

                                        MessageType::CursorPosition
                                        | MessageType::FileChange
                                        | MessageType::CommentAdded => {
                                            // Relayed to the room untouched.
                                            match group {
                                                Some(ref g) => {
                                                    g.broadcast_raw(Arc::new(bytes));
                                                }
                                                None => {
                                                    log::debug!("frame from {addr} before join");
                                                }
                                            }
                                        }

                                        MessageType::UserLeft => {
                                            log::info!("client {addr} leaving");
                                            break;
                                        }

                                        MessageType::Ping => {
                                            let pong = SyncMessage::pong(Uuid::nil());
                                            if !send_frame(&mut ws_sender, &pong).await {
                                                break;
                                            }
                                        }

                                        MessageType::OperationAck | MessageType::Pong => {
                                            log::debug!(
                                                "ignoring {:?} from client {addr}",
                                                sync_msg.msg_type
                                            );
                                        }
                                    }
                                }
                                Err(e) => {
                                    log::warn!("failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Frame the room queued for this client
                outbound = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // No broadcast receiver yet, wait forever
                        std::future::pending().await
                    }
                } => {
                    match outbound {
                        Ok(data) => {
                            // Never reflect a frame back at its author.
                            if let Ok(queued) = SyncMessage::decode(&data) {
                                if Some(queued.sender) == user_id {
                                    continue;
                                }
                            }
                            if ws_sender.send(Message::Binary(data.to_vec().into())).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("connection {addr} lagged by {n} frames");
                            if let Some(ref g) = group {
                                g.note_dropped(n);
                            }
                        }
                        Err(_) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        // Cleanup: remove peer from room, save files if the room empties
        if let (Some(uid), Some(pid)) = (user_id, project_id) {
            let mut rooms_w = rooms.write().await;
            let mut to_persist: Vec<(Uuid, String, u64)> = Vec::new();

            if let Some(room) = rooms_w.get_mut(&pid) {
                room.broadcast.remove_peer(&uid).await;
                let _ = room.broadcast.broadcast(&SyncMessage::user_left(uid, pid));

                if room.broadcast.peer_count().await == 0 {
                    for (fid, state) in &room.files {
                        to_persist.push((*fid, state.buffer.clone(), state.revision));
                    }
                    rooms_w.remove(&pid);
                    log::info!("project room {pid} closed (empty)");
                }
            }

            let room_count = rooms_w.len();
            drop(rooms_w);

            if let Some(ref store) = persistence {
                for (fid, content, revision) in to_persist {
                    match store.save_document(fid, &content, revision).await {
                        Ok(()) => log::info!("saved {fid} at revision {revision} (room closed)"),
                        Err(e) => log::error!("saving {fid} on room close failed: {e}"),
                    }
                }
            }

            let mut s = stats.write().await;
            s.active_rooms = room_count;
        }

        Ok(())
    }

    /// Reconcile one operation and answer its author. Returns true
    /// when the socket died and the connection loop should stop.
    async fn handle_operation(
        ws_sender: &mut ServerSink,
        broadcast_rx: &mut Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>>,
        rooms: &Arc<RwLock<HashMap<Uuid, ProjectRoom>>>,
        stats: &Arc<RwLock<ServerStats>>,
        group: Option<&Arc<BroadcastGroup>>,
        persistence: Option<&Arc<dyn DocumentPersistence>>,
        author: Uuid,
        pid: Uuid,
        file_id: Uuid,
        op: Operation,
        addr: SocketAddr,
    ) -> bool {
        // First touch of a file loads its stored copy, outside the
        // room lock.
        let known = {
            let rooms_r = rooms.read().await;
            rooms_r
                .get(&pid)
                .map_or(false, |room| room.files.contains_key(&file_id))
        };
        let loaded = if known {
            None
        } else if let Some(store) = persistence {
            match store.load_document(file_id).await {
                Ok(doc) => Some((doc.content, doc.revision)),
                Err(PersistError::NotFound(_)) => None,
                Err(e) => {
                    log::error!("loading {file_id} failed: {e}");
                    None
                }
            }
        } else {
            None
        };

        let outcome = {
            let mut rooms_w = rooms.write().await;
            rooms_w.get_mut(&pid).map(|room| {
                let state = room.files.entry(file_id).or_insert_with(|| match loaded {
                    Some((content, revision)) => FileState::new(content, revision),
                    None => FileState::new(String::new(), 0),
                });
                state.reconcile(op)
            })
        };

        match outcome {
            Some(Reconciled::Applied(applied)) => {
                let op_msg = SyncMessage::operation(author, pid, file_id, &applied);
                if let Some(g) = group {
                    let _ = g.broadcast(&op_msg);
                }

                // Frames already queued on this connection predate the
                // ack in stream order; flush them, up to our own
                // broadcast of this operation.
                if let Some(rx) = broadcast_rx {
                    loop {
                        match rx.try_recv() {
                            Ok(data) => {
                                if let Ok(queued) = SyncMessage::decode(&data) {
                                    if queued.sender == author {
                                        let is_marker = matches!(
                                            queued.operation_payload(),
                                            Ok(o) if o.id == applied.id
                                        );
                                        if is_marker {
                                            break;
                                        }
                                        continue;
                                    }
                                }
                                if ws_sender
                                    .send(Message::Binary(data.to_vec().into()))
                                    .await
                                    .is_err()
                                {
                                    return true;
                                }
                            }
                            Err(TryRecvError::Lagged(n)) => {
                                log::warn!("connection {addr} lagged by {n} frames");
                                if let Some(g) = group {
                                    g.note_dropped(n);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }

                let ack = SyncMessage::operation_ack(pid, file_id, applied.id);
                if !send_frame(ws_sender, &ack).await {
                    return true;
                }

                let mut s = stats.write().await;
                s.operations_applied += 1;
            }

            Some(Reconciled::Duplicate(op_id)) => {
                log::debug!("duplicate operation {op_id} from {author}, re-acking");
                let ack = SyncMessage::operation_ack(pid, file_id, op_id);
                if !send_frame(ws_sender, &ack).await {
                    return true;
                }

                let mut s = stats.write().await;
                s.operations_deduped += 1;
            }

            Some(Reconciled::BaseTooOld) => {
                log::warn!(
                    "operation from {author} predates the history window of {file_id}, sending snapshot"
                );
                let snapshot = {
                    let rooms_r = rooms.read().await;
                    rooms_r.get(&pid).and_then(|room| {
                        room.files.get(&file_id).map(|state| state.snapshot(file_id))
                    })
                };
                if let Some(snapshot) = snapshot {
                    let msg = SyncMessage::file_change(pid, &snapshot);
                    if !send_frame(ws_sender, &msg).await {
                        return true;
                    }
                }
            }

            None => {
                log::debug!("operation for unknown project {pid}");
            }
        }

        false
    }

    /// Snapshot of the server-wide counters.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// The address `run` binds.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
