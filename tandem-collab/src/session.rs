//! One collaborative editing session per open document.
//!
//! ```text
//!               ┌──────────────────────────────┐
//!  edits ──────▶│    CollaborationSession      │
//!               │   DocumentSession (buffer)   │
//!  SyncEvent ──▶│   SyncTransport  (socket)    │──▶ SessionUpdate
//!               │   PresenceRoster (cursors)   │
//!               └──────────────────────────────┘
//! ```
//!
//! The session owns all three parts exclusively. Everything that
//! mutates the document happens synchronously inside [`handle_event`];
//! the only suspension points are [`open`], [`save`] and [`resync`].
//! The application drains the transport's event receiver, feeds each
//! event through `handle_event`, and redraws from the returned
//! [`SessionUpdate`].
//!
//! [`handle_event`]: CollaborationSession::handle_event
//! [`open`]: CollaborationSession::open
//! [`save`]: CollaborationSession::save
//! [`resync`]: CollaborationSession::resync
//!
//! Reference: Kleppmann, Chapter 9 (Consistency and Consensus)

use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

use tandem_ot::DocumentSession;

use crate::persist::{DocumentPersistence, IdentityProvider, PersistError};
use crate::presence::{CursorPosition, PresenceRoster, Selection};
use crate::protocol::{CommentNotice, FileSnapshot, Participant, ProtocolError};
use crate::transport::{ConnectionState, ReconnectPolicy, SyncEvent, SyncTransport};

/// What the application should do after an event was handled.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// The buffer changed, redraw from `buffer()`
    Buffer { revision: u64 },
    /// Connection state changed
    Status(ConnectionState),
    /// A remote cursor moved or a peer expired
    PresenceChanged,
    /// Authoritative snapshot received, the application decides
    /// whether to adopt it
    FileChanged(FileSnapshot),
    /// A comment was posted
    Comment(CommentNotice),
    ParticipantJoined(Participant),
    ParticipantLeft(Uuid),
    /// Reconnected and resent this many pending operations
    PendingReplayed(usize),
}

#[derive(Debug)]
pub enum SessionError {
    Transport(ProtocolError),
    Persistence(PersistError),
    /// The replicas disagree at the same revision. Fatal; only
    /// `resync` recovers.
    Desynchronized,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(e) => write!(f, "transport error: {e}"),
            SessionError::Persistence(e) => write!(f, "persistence error: {e}"),
            SessionError::Desynchronized => {
                write!(f, "document desynchronized, resync required")
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Transport(e)
    }
}

impl From<PersistError> for SessionError {
    fn from(e: PersistError) -> Self {
        SessionError::Persistence(e)
    }
}

/// An open document shared with a project room.
pub struct CollaborationSession {
    doc: DocumentSession,
    transport: SyncTransport,
    roster: PresenceRoster,
    participant: Participant,
}

impl CollaborationSession {
    /// Resolve the local identity, load the document, and start the
    /// transport supervisor.
    ///
    /// A missing document starts from an empty buffer at revision 0.
    /// An unreachable server is not an error here: the supervisor
    /// keeps dialing in the background and the session reports
    /// progress through `Status` events.
    pub async fn open(
        server_url: impl Into<String>,
        project_id: Uuid,
        file_id: Uuid,
        identity: &dyn IdentityProvider,
        persistence: &dyn DocumentPersistence,
        policy: ReconnectPolicy,
    ) -> Result<Self, SessionError> {
        let participant = identity.identity();

        let (content, revision) = match persistence.load_document(file_id).await {
            Ok(stored) => (stored.content, stored.revision),
            Err(PersistError::NotFound(_)) => {
                log::info!("no stored copy of {file_id}, starting empty");
                (String::new(), 0)
            }
            Err(e) => return Err(SessionError::Persistence(e)),
        };

        let doc = DocumentSession::new(project_id, file_id, participant.user_id, content, revision);
        let roster = PresenceRoster::new(participant.user_id);
        let mut transport =
            SyncTransport::new(server_url, project_id, participant.clone(), policy);
        transport.connect();

        Ok(Self {
            doc,
            transport,
            roster,
            participant,
        })
    }

    /// Insert `text` at `index`, apply locally, and forward to the
    /// server. Returns the operation id the ack will carry.
    pub fn insert(&mut self, index: usize, text: &str) -> Uuid {
        let op = self.doc.submit_insert(index, text);
        self.transport.send_operation(self.doc.file_id(), &op);
        op.id
    }

    /// Delete `length` characters starting at `index`.
    pub fn delete(&mut self, index: usize, length: usize) -> Uuid {
        let op = self.doc.submit_delete(index, length);
        self.transport.send_operation(self.doc.file_id(), &op);
        op.id
    }

    /// The synchronous core: route one transport event through the
    /// document, the pending queue, or the roster.
    pub fn handle_event(&mut self, event: SyncEvent) -> Result<Option<SessionUpdate>, SessionError> {
        match event {
            SyncEvent::Operation { file_id, op } => {
                if file_id != self.doc.file_id() {
                    return Ok(None);
                }
                match self.doc.receive_remote(op) {
                    Some(_) => Ok(Some(SessionUpdate::Buffer {
                        revision: self.doc.revision(),
                    })),
                    None => Ok(None),
                }
            }
            SyncEvent::OperationAck(op_id) => {
                self.doc.acknowledge(op_id);
                Ok(None)
            }
            SyncEvent::Status(ConnectionState::Connected) => {
                let replayed = self.replay_pending();
                if replayed > 0 {
                    Ok(Some(SessionUpdate::PendingReplayed(replayed)))
                } else {
                    Ok(Some(SessionUpdate::Status(ConnectionState::Connected)))
                }
            }
            SyncEvent::Status(state) => Ok(Some(SessionUpdate::Status(state))),
            SyncEvent::Cursor(position) => {
                if self.roster.observe(position) {
                    Ok(Some(SessionUpdate::PresenceChanged))
                } else {
                    Ok(None)
                }
            }
            SyncEvent::FileChanged(snapshot) => {
                // A snapshot at our own revision must match our buffer
                // byte for byte; anything else means the replicas have
                // drifted apart.
                if snapshot.file_id == self.doc.file_id()
                    && snapshot.revision == self.doc.revision()
                    && snapshot.content != self.doc.buffer()
                {
                    log::error!(
                        "snapshot of {} diverges from local copy at revision {}",
                        snapshot.file_id,
                        snapshot.revision
                    );
                    return Err(SessionError::Desynchronized);
                }
                Ok(Some(SessionUpdate::FileChanged(snapshot)))
            }
            SyncEvent::CommentAdded(notice) => Ok(Some(SessionUpdate::Comment(notice))),
            SyncEvent::ParticipantJoined(participant) => {
                Ok(Some(SessionUpdate::ParticipantJoined(participant)))
            }
            SyncEvent::ParticipantLeft(user_id) => {
                self.roster.remove_user(user_id);
                Ok(Some(SessionUpdate::ParticipantLeft(user_id)))
            }
        }
    }

    /// Throttled local cursor broadcast.
    pub fn cursor_moved(&mut self, line: u32, column: u32, selection: Option<Selection>) {
        let file_id = self.doc.file_id();
        if let Some(position) = self.roster.update_local_cursor(
            file_id,
            &self.participant.name,
            line,
            column,
            selection,
        ) {
            self.transport.send_cursor(&position);
        }
    }

    /// Push `{content, revision}` to storage.
    pub async fn save(&self, persistence: &dyn DocumentPersistence) -> Result<(), SessionError> {
        persistence
            .save_document(self.doc.file_id(), self.doc.buffer(), self.doc.revision())
            .await?;
        log::debug!(
            "saved {} at revision {}",
            self.doc.file_id(),
            self.doc.revision()
        );
        Ok(())
    }

    /// Recovery from `Desynchronized`: reload the authoritative copy
    /// and drop every pending operation.
    pub async fn resync(
        &mut self,
        persistence: &dyn DocumentPersistence,
    ) -> Result<(), SessionError> {
        let stored = persistence.load_document(self.doc.file_id()).await?;
        self.doc.resync(stored.content, stored.revision);
        Ok(())
    }

    /// Tear down the transport. Pending operations stay in memory
    /// until the session itself is dropped.
    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Take the transport's event receiver (once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.transport.take_events()
    }

    fn replay_pending(&self) -> usize {
        let file_id = self.doc.file_id();
        let count = self.doc.pending_len();
        for op in self.doc.pending_ops() {
            self.transport.send_operation(file_id, op);
        }
        if count > 0 {
            log::info!("replaying {count} pending operations after reconnect");
        }
        count
    }

    pub fn buffer(&self) -> &str {
        self.doc.buffer()
    }

    pub fn revision(&self) -> u64 {
        self.doc.revision()
    }

    pub fn checksum(&self) -> u64 {
        self.doc.checksum()
    }

    pub fn pending_len(&self) -> usize {
        self.doc.pending_len()
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Remote cursors currently visible in this document.
    pub fn cursors(&mut self) -> Vec<CursorPosition> {
        let file_id = self.doc.file_id();
        self.roster.cursors_for_file(file_id)
    }
}
