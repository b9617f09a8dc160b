//! Per-document session state: buffer, revision, and the pending queue.
//!
//! One [`DocumentSession`] exists per open document per client and owns
//! its buffer exclusively. Local edits apply optimistically and wait in
//! the pending queue until the coordinating server acknowledges them;
//! remote operations are transformed over that queue before applying.
//!
//! The pending queue doubles as the resend set. After a reconnect every
//! entry goes back out in original order, byte for byte, because each
//! entry's index describes the buffer at the moment it was applied
//! locally and the server re-reconciles from the recorded revision.

use uuid::Uuid;

use crate::operation::{apply, Operation};
use crate::transform::transform;

/// Client-side state for one collaboratively edited document.
#[derive(Debug, Clone)]
pub struct DocumentSession {
    project_id: Uuid,
    file_id: Uuid,
    author: Uuid,
    buffer: String,
    revision: u64,
    pending: Vec<Operation>,
}

impl DocumentSession {
    /// Start a session from persisted content and its revision.
    pub fn new(
        project_id: Uuid,
        file_id: Uuid,
        author: Uuid,
        content: impl Into<String>,
        revision: u64,
    ) -> Self {
        Self {
            project_id,
            file_id,
            author,
            buffer: content.into(),
            revision,
            pending: Vec::new(),
        }
    }

    /// Insert text locally. Applies immediately, bumps the revision and
    /// queues the operation for acknowledgment. Returns the operation to
    /// forward to the transport.
    pub fn submit_insert(&mut self, index: usize, text: impl Into<String>) -> Operation {
        let op = Operation::insert(index, text, self.author, self.revision);
        self.apply_local(op)
    }

    /// Delete characters locally. Same contract as [`submit_insert`].
    ///
    /// [`submit_insert`]: DocumentSession::submit_insert
    pub fn submit_delete(&mut self, index: usize, length: usize) -> Operation {
        let op = Operation::delete(index, length, self.author, self.revision);
        self.apply_local(op)
    }

    fn apply_local(&mut self, op: Operation) -> Operation {
        self.buffer = apply(&self.buffer, &op);
        self.revision += 1;
        self.pending.push(op.clone());
        log::trace!(
            "local op {} queued, revision {}, {} pending",
            op.id,
            self.revision,
            self.pending.len()
        );
        op
    }

    /// Integrate an operation relayed by the server.
    ///
    /// The local author's own operations come back as acknowledgments,
    /// so an echo carrying our author id is discarded here and `None` is
    /// returned. Anything else is transformed over the pending queue,
    /// oldest first, applied, and returned in its applied form. The
    /// pending entries themselves are never rewritten.
    pub fn receive_remote(&mut self, op: Operation) -> Option<Operation> {
        if op.author == self.author {
            log::trace!("discarding echo of local op {}", op.id);
            return None;
        }

        let mut incoming = op;
        for local in &self.pending {
            let (adjusted, _) = transform(&incoming, local);
            incoming = adjusted;
        }

        self.buffer = apply(&self.buffer, &incoming);
        self.revision += 1;
        log::trace!(
            "remote op {} applied at revision {}",
            incoming.id,
            self.revision
        );
        Some(incoming)
    }

    /// Mark one pending operation as accepted by the server.
    ///
    /// Removes exactly the matching entry. Acknowledgments may arrive in
    /// any order, and repeating one is a harmless no-op.
    pub fn acknowledge(&mut self, op_id: Uuid) -> bool {
        match self.pending.iter().position(|op| op.id == op_id) {
            Some(position) => {
                self.pending.remove(position);
                log::trace!("op {} acknowledged, {} pending", op_id, self.pending.len());
                true
            }
            None => false,
        }
    }

    /// Operations awaiting acknowledgment, in submission order.
    pub fn pending_ops(&self) -> &[Operation] {
        &self.pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Replace local state with an authoritative copy and drop the
    /// pending queue. This is the recovery path for a replica that has
    /// diverged; unacknowledged local edits are abandoned.
    pub fn resync(&mut self, content: impl Into<String>, revision: u64) {
        let dropped = self.pending.len();
        self.buffer = content.into();
        self.revision = revision;
        self.pending.clear();
        log::warn!(
            "session {} resynced to revision {}, dropped {} pending ops",
            self.file_id,
            revision,
            dropped
        );
    }

    /// FNV-1a hash of the buffer, for out-of-band comparison between
    /// replicas.
    pub fn checksum(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in self.buffer.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    pub fn author(&self) -> Uuid {
        self.author
    }
}
