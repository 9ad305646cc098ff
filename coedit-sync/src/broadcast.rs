//! Outbound messages: local edits, snapshots, cursor and presence announcements.
//!
//! The broadcaster only builds [`Publication`]s; the session hands them to the
//! router. Publication is fire-and-forget: nothing here waits for an
//! acknowledgement or orders messages across clients.

use serde_json::Value;

use crate::protocol::{
    change_args, ping_args, presence_args, ChangeEvent, CursorUpdate, EditSpan, Ping,
    PresenceUser, TopicKind,
};

/// A message ready for `publish(topic, args)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub args: Vec<Value>,
}

/// Why a local edit was not published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppressed {
    /// A remote change is being applied; the edit is its echo.
    ApplyingRemote,
    /// No open connection, or the document has not been fetched on it yet.
    NotConnected,
    /// The edit carries no actual change.
    Empty,
}

/// Turns local activity into publications for one document and user.
#[derive(Debug, Clone)]
pub struct ChangeBroadcaster {
    document_id: String,
    user: PresenceUser,
}

impl ChangeBroadcaster {
    pub fn new(document_id: impl Into<String>, user: PresenceUser) -> Self {
        Self {
            document_id: document_id.into(),
            user,
        }
    }

    /// Build the `RangeEdits` publication for one local edit transaction.
    ///
    /// Only the spans the editor reported are sent, never the whole document.
    /// No-op spans are dropped.
    pub fn local_edit(
        &self,
        spans: &[EditSpan],
        applying_remote: bool,
        connected: bool,
    ) -> Result<Publication, Suppressed> {
        if applying_remote {
            return Err(Suppressed::ApplyingRemote);
        }
        if !connected {
            return Err(Suppressed::NotConnected);
        }
        let edits: Vec<EditSpan> = spans.iter().filter(|s| !s.is_noop()).cloned().collect();
        if edits.is_empty() {
            return Err(Suppressed::Empty);
        }
        Ok(self.change(&ChangeEvent::RangeEdits { edits }))
    }

    /// Full-text snapshot, sent to catch up a newly joined peer.
    pub fn full_text(&self, text: String) -> Publication {
        self.change(&ChangeEvent::FullText { text })
    }

    pub fn cursor(&self, position: usize) -> Publication {
        let update = CursorUpdate {
            document_id: self.document_id.clone(),
            position,
            user_id: self.user.id.clone(),
            username: self.user.username.clone(),
        };
        Publication {
            topic: TopicKind::CursorMoved.topic(&self.document_id),
            args: update.to_args(),
        }
    }

    pub fn joined(&self) -> Publication {
        Publication {
            topic: TopicKind::UserJoined.topic(&self.document_id),
            args: presence_args(&self.document_id, &self.user),
        }
    }

    pub fn left(&self) -> Publication {
        Publication {
            topic: TopicKind::UserLeft.topic(&self.document_id),
            args: presence_args(&self.document_id, &self.user),
        }
    }

    /// Keepalive with an epoch-millisecond timestamp.
    pub fn ping(&self, timestamp: u64) -> Publication {
        let ping = Ping {
            user_id: self.user.id.clone(),
            timestamp,
        };
        Publication {
            topic: TopicKind::Ping.topic(&self.document_id),
            args: ping_args(&self.document_id, &ping),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn user(&self) -> &PresenceUser {
        &self.user
    }

    fn change(&self, change: &ChangeEvent) -> Publication {
        Publication {
            topic: TopicKind::DocumentChanged.topic(&self.document_id),
            args: change_args(&self.document_id, change, &self.user.id),
        }
    }
}
