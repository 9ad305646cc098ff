//! Presence tracking: who else is viewing this document.
//!
//! ## Data flow
//!
//! ```text
//! code.user.joined ──► PresenceTracker::user_joined() ──► Some(list) on a new peer
//!                                                         └─► session broadcasts FullText
//! code.user.left   ──► PresenceTracker::user_left()   ──► Some(list) if the peer was known
//! code.cursor.*    ──► PresenceTracker::cursor_moved() ─► last-known cursor per peer
//! ```
//!
//! Self-events (`user.id == local_user_id`) are ignored everywhere.

use std::collections::HashMap;

use crate::protocol::PresenceUser;

/// A remote user viewing the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub username: String,
    /// Last cursor offset the peer broadcast, if any.
    pub cursor: Option<usize>,
}

/// Set of remote users keyed by user id.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local_user_id: String,
    peers: HashMap<String, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            peers: HashMap::new(),
        }
    }

    /// Add a peer. Returns the updated list when the peer is new, `None` for
    /// duplicates and self-events.
    pub fn user_joined(&mut self, user: &PresenceUser) -> Option<Vec<PresenceRecord>> {
        if user.id == self.local_user_id || self.peers.contains_key(&user.id) {
            return None;
        }
        self.peers.insert(
            user.id.clone(),
            PresenceRecord {
                user_id: user.id.clone(),
                username: user.username.clone(),
                cursor: None,
            },
        );
        Some(self.snapshot())
    }

    /// Remove a peer by id. Returns the updated list when a peer was removed.
    pub fn user_left(&mut self, user: &PresenceUser) -> Option<Vec<PresenceRecord>> {
        if user.id == self.local_user_id {
            return None;
        }
        self.peers.remove(&user.id)?;
        Some(self.snapshot())
    }

    /// Record a peer's cursor. A cursor from an unknown peer registers that
    /// peer (it joined before we subscribed). Returns `true` in that case.
    pub fn cursor_moved(&mut self, user_id: &str, username: &str, position: usize) -> bool {
        if user_id == self.local_user_id {
            return false;
        }
        match self.peers.get_mut(user_id) {
            Some(peer) => {
                peer.cursor = Some(position);
                if peer.username.is_empty() && !username.is_empty() {
                    peer.username = username.to_string();
                }
                false
            }
            None => {
                self.peers.insert(
                    user_id.to_string(),
                    PresenceRecord {
                        user_id: user_id.to_string(),
                        username: username.to_string(),
                        cursor: Some(position),
                    },
                );
                true
            }
        }
    }

    /// Peers ordered by username, then id, for display.
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let mut peers: Vec<PresenceRecord> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            a.username
                .cmp(&b.username)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        peers
    }

    pub fn peer(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.peers.get(user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, name: &str) -> PresenceUser {
        PresenceUser::new(id, name)
    }

    #[test]
    fn test_join_adds_peer() {
        let mut tracker = PresenceTracker::new("me");
        let list = tracker.user_joined(&user("b", "bob")).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].username, "bob");
        assert_eq!(tracker.peer_count(), 1);
    }

    #[test]
    fn test_duplicate_join_is_noop() {
        let mut tracker = PresenceTracker::new("me");
        assert!(tracker.user_joined(&user("b", "bob")).is_some());
        assert!(tracker.user_joined(&user("b", "bob")).is_none());
        assert_eq!(tracker.peer_count(), 1);
    }

    #[test]
    fn test_ignores_self() {
        let mut tracker = PresenceTracker::new("me");
        assert!(tracker.user_joined(&user("me", "myself")).is_none());
        assert!(tracker.user_left(&user("me", "myself")).is_none());
        assert!(!tracker.cursor_moved("me", "myself", 4));
        assert_eq!(tracker.peer_count(), 0);
    }

    #[test]
    fn test_leave_absent_is_noop() {
        let mut tracker = PresenceTracker::new("me");
        assert!(tracker.user_left(&user("ghost", "")).is_none());

        tracker.user_joined(&user("b", "bob"));
        let list = tracker.user_left(&user("b", "bob")).unwrap();
        assert!(list.is_empty());
        assert!(tracker.user_left(&user("b", "bob")).is_none());
    }

    #[test]
    fn test_snapshot_ordering() {
        let mut tracker = PresenceTracker::new("me");
        tracker.user_joined(&user("3", "carol"));
        tracker.user_joined(&user("1", "alice"));
        tracker.user_joined(&user("2", "bob"));
        let names: Vec<String> = tracker.snapshot().into_iter().map(|p| p.username).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
    }

    #[test]
    fn test_cursor_updates_known_peer() {
        let mut tracker = PresenceTracker::new("me");
        tracker.user_joined(&user("b", "bob"));
        assert!(!tracker.cursor_moved("b", "bob", 12));
        assert_eq!(tracker.peer("b").unwrap().cursor, Some(12));
    }

    #[test]
    fn test_cursor_from_unknown_peer_registers() {
        let mut tracker = PresenceTracker::new("me");
        assert!(tracker.cursor_moved("z", "zed", 3));
        assert_eq!(tracker.peer("z").unwrap().username, "zed");
        // A later join for the same peer is a duplicate.
        assert!(tracker.user_joined(&user("z", "zed")).is_none());
    }
}
