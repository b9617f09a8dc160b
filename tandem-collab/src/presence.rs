//! Presence tracking for real-time cursor and selection sharing.
//!
//! Provides multiplayer "who's editing where": cursor positions and
//! selections per file, with a freshness window so crashed peers fade
//! out of the roster instead of lingering.
//!
//! ## Architecture
//!
//! ```text
//! local caret moves
//!       │
//!       ▼
//! PresenceRoster::update_local_cursor()
//!       │  (rate-limited: 50ms)
//!       ▼
//! SyncMessage::cursor { … }
//!       │
//!       ▼   (relayed through the room)
//! remote PresenceRoster::observe()
//!       │
//!       ▼
//! editor overlay rendering
//! ```
//!
//! ## Performance Targets
//!
//! | Metric | Target | Reference |
//! |--------|--------|-----------|
//! | Roster observe | <200ns | Kleppmann §8 |
//! | Prune 100 peers | <10µs | — |
//! | Memory per tracked cursor | <1KB | — |
//!
//! Reference: Kleppmann, Chapter 8 (The Trouble with Distributed Systems)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A selected range in line/column coordinates, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl Selection {
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }
}

/// One user's cursor in one file, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub user_id: Uuid,
    pub user_name: String,
    pub file_id: Uuid,
    pub line: u32,
    pub column: u32,
    /// Active selection, if any. The cursor sits at the selection end.
    pub selection: Option<Selection>,
    /// Unix milliseconds at the sender, display metadata only
    pub timestamp: u64,
}

impl CursorPosition {
    pub fn new(
        user_id: Uuid,
        user_name: impl Into<String>,
        file_id: Uuid,
        line: u32,
        column: u32,
    ) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            file_id,
            line,
            column,
            selection: None,
            timestamp: unix_millis(),
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }
}

struct RosterEntry {
    cursor: CursorPosition,
    refreshed: Instant,
}

/// Tracks every remote cursor the local client knows about.
///
/// Entries are keyed by (file, user) so one user shows a cursor per
/// open file. An entry older than the freshness window is dropped the
/// next time the roster is read; there is no background timer.
pub struct PresenceRoster {
    local_user_id: Uuid,
    entries: HashMap<(Uuid, Uuid), RosterEntry>,
    /// Entries older than this are dropped on the next read.
    ttl: Duration,
    /// Rate limiter: last time we broadcast our own cursor.
    last_broadcast: Instant,
    broadcast_interval: Duration,
}

impl PresenceRoster {
    pub fn new(local_user_id: Uuid) -> Self {
        Self {
            local_user_id,
            entries: HashMap::new(),
            ttl: Duration::from_secs(5),
            // Allow an immediate first broadcast.
            last_broadcast: Instant::now() - Duration::from_secs(1),
            broadcast_interval: Duration::from_millis(50),
        }
    }

    /// Create with a custom freshness window (for testing).
    pub fn with_ttl(local_user_id: Uuid, ttl: Duration) -> Self {
        let mut roster = Self::new(local_user_id);
        roster.ttl = ttl;
        roster
    }

    /// Create with a custom broadcast interval (for testing).
    pub fn with_interval(local_user_id: Uuid, interval: Duration) -> Self {
        let mut roster = Self::new(local_user_id);
        roster.broadcast_interval = interval;
        roster
    }

    /// Record a cursor update from the network.
    ///
    /// The newest update always wins, whatever its timestamp says; the
    /// sender's wall clock is not trusted for ordering. Our own echoes
    /// are ignored. Returns whether the roster changed.
    pub fn observe(&mut self, cursor: CursorPosition) -> bool {
        if cursor.user_id == self.local_user_id {
            return false;
        }
        let key = (cursor.file_id, cursor.user_id);
        self.entries.insert(
            key,
            RosterEntry {
                cursor,
                refreshed: Instant::now(),
            },
        );
        true
    }

    /// All fresh cursors in one file.
    pub fn cursors_for_file(&mut self, file_id: Uuid) -> Vec<CursorPosition> {
        self.prune_expired();
        self.entries
            .values()
            .filter(|entry| entry.cursor.file_id == file_id)
            .map(|entry| entry.cursor.clone())
            .collect()
    }

    /// Drop entries older than the freshness window. Returns the user
    /// ids whose entries expired.
    pub fn prune_expired(&mut self) -> Vec<Uuid> {
        let ttl = self.ttl;
        let stale: Vec<(Uuid, Uuid)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.refreshed.elapsed() > ttl)
            .map(|(key, _)| *key)
            .collect();

        for key in &stale {
            self.entries.remove(key);
        }

        stale.into_iter().map(|(_, user_id)| user_id).collect()
    }

    /// Number of distinct remote users with a fresh cursor anywhere.
    pub fn active_peers(&mut self) -> usize {
        self.prune_expired();
        let mut users: Vec<Uuid> = self
            .entries
            .keys()
            .map(|(_, user_id)| *user_id)
            .collect();
        users.sort_unstable();
        users.dedup();
        users.len()
    }

    /// Remove every entry for one user, on a clean departure.
    pub fn remove_user(&mut self, user_id: Uuid) {
        self.entries.retain(|(_, entry_user), _| *entry_user != user_id);
    }

    /// Update the local cursor and return a position to broadcast, or
    /// `None` while throttled.
    pub fn update_local_cursor(
        &mut self,
        file_id: Uuid,
        user_name: &str,
        line: u32,
        column: u32,
        selection: Option<Selection>,
    ) -> Option<CursorPosition> {
        if self.last_broadcast.elapsed() < self.broadcast_interval {
            return None;
        }
        self.last_broadcast = Instant::now();

        let mut cursor = CursorPosition::new(self.local_user_id, user_name, file_id, line, column);
        cursor.selection = selection;
        Some(cursor)
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn cursor(user_id: Uuid, file_id: Uuid, line: u32, column: u32) -> CursorPosition {
        CursorPosition::new(user_id, "peer", file_id, line, column)
    }

    #[test]
    fn test_cursor_position_new() {
        let user = Uuid::new_v4();
        let file = Uuid::new_v4();
        let pos = CursorPosition::new(user, "Alice", file, 12, 4);

        assert_eq!(pos.user_id, user);
        assert_eq!(pos.file_id, file);
        assert_eq!(pos.line, 12);
        assert_eq!(pos.column, 4);
        assert!(pos.selection.is_none());
        assert!(pos.timestamp > 0);
    }

    #[test]
    fn test_cursor_position_with_selection() {
        let pos = CursorPosition::new(Uuid::new_v4(), "Alice", Uuid::new_v4(), 5, 0)
            .with_selection(Selection::new(3, 0, 5, 0));

        let sel = pos.selection.unwrap();
        assert_eq!(sel.start_line, 3);
        assert_eq!(sel.end_line, 5);
    }

    #[test]
    fn test_roster_observes_remote_cursor() {
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        let file = Uuid::new_v4();
        let remote = Uuid::new_v4();

        assert!(roster.observe(cursor(remote, file, 1, 2)));
        let cursors = roster.cursors_for_file(file);
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].line, 1);
    }

    #[test]
    fn test_roster_ignores_own_echo() {
        let local = Uuid::new_v4();
        let mut roster = PresenceRoster::new(local);
        let file = Uuid::new_v4();

        assert!(!roster.observe(cursor(local, file, 1, 2)));
        assert!(roster.cursors_for_file(file).is_empty());
    }

    #[test]
    fn test_roster_newest_update_wins() {
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        let file = Uuid::new_v4();
        let remote = Uuid::new_v4();

        roster.observe(cursor(remote, file, 1, 0));
        // Second update replaces the first even with an older timestamp.
        let mut rewound = cursor(remote, file, 9, 9);
        rewound.timestamp = 0;
        roster.observe(rewound);

        let cursors = roster.cursors_for_file(file);
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].line, 9);
    }

    #[test]
    fn test_roster_keys_by_file_and_user() {
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        let file_a = Uuid::new_v4();
        let file_b = Uuid::new_v4();
        let remote = Uuid::new_v4();

        roster.observe(cursor(remote, file_a, 1, 0));
        roster.observe(cursor(remote, file_b, 2, 0));

        assert_eq!(roster.cursors_for_file(file_a).len(), 1);
        assert_eq!(roster.cursors_for_file(file_b).len(), 1);
        assert_eq!(roster.active_peers(), 1);
    }

    #[test]
    fn test_roster_prunes_expired_entries() {
        let mut roster = PresenceRoster::with_ttl(Uuid::new_v4(), Duration::from_millis(10));
        let file = Uuid::new_v4();
        let remote = Uuid::new_v4();

        roster.observe(cursor(remote, file, 1, 0));
        thread::sleep(Duration::from_millis(20));

        let pruned = roster.prune_expired();
        assert_eq!(pruned, vec![remote]);
        assert!(roster.cursors_for_file(file).is_empty());
    }

    #[test]
    fn test_roster_read_prunes_stale() {
        let mut roster = PresenceRoster::with_ttl(Uuid::new_v4(), Duration::from_millis(10));
        let file = Uuid::new_v4();

        roster.observe(cursor(Uuid::new_v4(), file, 1, 0));
        thread::sleep(Duration::from_millis(20));
        roster.observe(cursor(Uuid::new_v4(), file, 2, 0));

        let cursors = roster.cursors_for_file(file);
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].line, 2);
    }

    #[test]
    fn test_roster_remove_user_clears_all_files() {
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        let remote = Uuid::new_v4();
        let file_a = Uuid::new_v4();
        let file_b = Uuid::new_v4();

        roster.observe(cursor(remote, file_a, 1, 0));
        roster.observe(cursor(remote, file_b, 1, 0));
        roster.remove_user(remote);

        assert!(roster.cursors_for_file(file_a).is_empty());
        assert!(roster.cursors_for_file(file_b).is_empty());
    }

    #[test]
    fn test_local_cursor_throttled() {
        let mut roster = PresenceRoster::with_interval(Uuid::new_v4(), Duration::from_millis(50));
        let file = Uuid::new_v4();

        // First update goes through, the immediate second is dropped.
        assert!(roster
            .update_local_cursor(file, "me", 1, 0, None)
            .is_some());
        assert!(roster
            .update_local_cursor(file, "me", 1, 1, None)
            .is_none());
    }

    #[test]
    fn test_local_cursor_after_interval() {
        let mut roster = PresenceRoster::with_interval(Uuid::new_v4(), Duration::from_millis(5));
        let file = Uuid::new_v4();

        let _ = roster.update_local_cursor(file, "me", 1, 0, None);
        thread::sleep(Duration::from_millis(10));
        let again = roster.update_local_cursor(file, "me", 2, 0, None);
        assert!(again.is_some());
        assert_eq!(again.unwrap().line, 2);
    }

    #[test]
    fn test_local_cursor_carries_selection() {
        let local = Uuid::new_v4();
        let mut roster = PresenceRoster::new(local);
        let file = Uuid::new_v4();

        let sel = Selection::new(0, 0, 2, 10);
        let pos = roster
            .update_local_cursor(file, "me", 2, 10, Some(sel))
            .unwrap();

        assert_eq!(pos.user_id, local);
        assert_eq!(pos.selection, Some(sel));
    }

    #[test]
    fn test_active_peers_counts_distinct_users() {
        let mut roster = PresenceRoster::new(Uuid::new_v4());
        let file = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        roster.observe(cursor(a, file, 1, 0));
        roster.observe(cursor(b, file, 2, 0));
        roster.observe(cursor(a, file, 3, 0));

        assert_eq!(roster.active_peers(), 2);
    }
}
