//! Character-level edit operations and their application.
//!
//! An [`Operation`] is immutable once created: it records what one author
//! did to one document at one revision. Indexes are character offsets,
//! never byte offsets, so multi-byte text cannot split a UTF-8 boundary.
//!
//! Application never fails. Out-of-range indexes clamp to the buffer end
//! and over-length deletes truncate to what is available, which keeps
//! replicas applying the same operation stream even when concurrent
//! edits have shrunk the buffer underneath an operation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an operation does to the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Splice text in at the operation's index.
    Insert(String),
    /// Remove this many characters starting at the operation's index.
    Delete(usize),
    /// Position placeholder produced by transformation. Applies as a no-op
    /// and is never sent over the wire.
    Retain,
}

/// A single edit, attributed and revision-stamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id, used for acknowledgment matching and delivery dedup.
    pub id: Uuid,
    pub kind: OpKind,
    /// Character offset into the buffer as it existed at `revision`.
    pub index: usize,
    /// The author's user id.
    pub author: Uuid,
    /// Buffer revision this operation was issued against.
    pub revision: u64,
    /// Wall-clock creation time, unix milliseconds.
    pub timestamp: u64,
}

impl Operation {
    /// Create an insert operation.
    pub fn insert(index: usize, content: impl Into<String>, author: Uuid, revision: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: OpKind::Insert(content.into()),
            index,
            author,
            revision,
            timestamp: unix_millis(),
        }
    }

    /// Create a delete operation.
    pub fn delete(index: usize, length: usize, author: Uuid, revision: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: OpKind::Delete(length),
            index,
            author,
            revision,
            timestamp: unix_millis(),
        }
    }

    /// Create a retain placeholder.
    pub fn retain(author: Uuid, revision: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: OpKind::Retain,
            index: 0,
            author,
            revision,
            timestamp: unix_millis(),
        }
    }

    /// Number of characters this operation adds or removes.
    pub fn width(&self) -> usize {
        match &self.kind {
            OpKind::Insert(text) => text.chars().count(),
            OpKind::Delete(length) => *length,
            OpKind::Retain => 0,
        }
    }

    /// Whether applying this operation leaves any buffer unchanged.
    pub fn is_noop(&self) -> bool {
        match &self.kind {
            OpKind::Insert(text) => text.is_empty(),
            OpKind::Delete(length) => *length == 0,
            OpKind::Retain => true,
        }
    }
}

/// Apply one operation to a buffer, returning the new buffer.
///
/// Clamp policy: an insert index past the end appends, a delete starting
/// past the end is a no-op, and a delete running past the end truncates.
pub fn apply(buffer: &str, op: &Operation) -> String {
    match &op.kind {
        OpKind::Insert(text) => {
            let total = buffer.chars().count();
            let at = byte_offset(buffer, op.index.min(total));
            let mut out = String::with_capacity(buffer.len() + text.len());
            out.push_str(&buffer[..at]);
            out.push_str(text);
            out.push_str(&buffer[at..]);
            out
        }
        OpKind::Delete(length) => {
            let total = buffer.chars().count();
            let start = op.index.min(total);
            let length = (*length).min(total - start);
            if length == 0 {
                return buffer.to_string();
            }
            let from = byte_offset(buffer, start);
            let to = byte_offset(buffer, start + length);
            let mut out = String::with_capacity(buffer.len());
            out.push_str(&buffer[..from]);
            out.push_str(&buffer[to..]);
            out
        }
        OpKind::Retain => buffer.to_string(),
    }
}

/// Byte position of the `char_index`-th character, or the buffer end.
fn byte_offset(buffer: &str, char_index: usize) -> usize {
    buffer
        .char_indices()
        .nth(char_index)
        .map(|(pos, _)| pos)
        .unwrap_or(buffer.len())
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
