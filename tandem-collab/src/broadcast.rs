//! Per-room frame fan-out.
//!
//! Every member of a project room subscribes to one tokio broadcast
//! channel carrying reference-counted, pre-encoded frames: an
//! operation is serialized once no matter how many members listen.
//! A receiver that stops draining falls behind by at most `capacity`
//! frames; past that the channel overwrites the oldest and the
//! connection is told how many it lost.
//!
//! Reference: Kleppmann, Chapter 11 (Stream Processing)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Participant, ProtocolError, SyncMessage};

/// Counter snapshot for one room, taken by [`BroadcastGroup::stats`].
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_peers: usize,
}

/// One project room's fan-out channel plus its member roster.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, Participant>>,
    capacity: usize,
    counters: FrameCounters,
}

impl BroadcastGroup {
    /// `capacity` bounds how far one receiver may lag before it starts
    /// losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            counters: FrameCounters::default(),
        }
    }

    /// Register a member and hand back their receiver.
    pub async fn add_peer(&self, participant: Participant) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(participant.user_id, participant);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, user_id: &Uuid) -> Option<Participant> {
        let mut peers = self.peers.write().await;
        peers.remove(user_id)
    }

    /// Encode `msg` once and queue it for every member, the sender's
    /// own connection included; skipping the sender is the reader's
    /// job. Returns how many receivers the frame reached.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.push(frame))
    }

    /// Queue an already-encoded frame without touching its bytes.
    pub fn broadcast_raw(&self, frame: Arc<Vec<u8>>) -> usize {
        self.push(frame)
    }

    fn push(&self, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver lost.
    pub fn note_dropped(&self, count: u64) {
        self.counters.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// The current member roster.
    pub async fn peers(&self) -> Vec<Participant> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, user_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(user_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.counters.sent.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without joining the roster, for server-internal taps.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Send/drop totals, kept in atomics so the frame path never takes
/// the roster lock.
#[derive(Default)]
struct FrameCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Hands out the [`BroadcastGroup`] for a project, creating it on
/// first use. Embedders running their own accept loop route each
/// connection through one of these; traffic never crosses projects.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, project_id: Uuid) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&project_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Re-check: another task may have created the room while we
        // waited for the write lock.
        if let Some(room) = rooms.get(&project_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(project_id, room.clone());
        room
    }

    /// Drop the room once its last member has left. Returns whether a
    /// room was removed.
    pub async fn remove_if_empty(&self, project_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(project_id) {
            if room.peer_count().await == 0 {
                rooms.remove(project_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_projects(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
