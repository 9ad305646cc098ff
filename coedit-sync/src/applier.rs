//! Inbound document changes: filtering, guarded application, echo suppression.
//!
//! ```text
//! [documentId, change, senderId]
//!       │
//!       ├── other document / own sender ──► Ignored
//!       ▼
//! RemoteApplyFlag::enter()          (guard raised)
//!       │  decode change ── malformed ──► Dropped
//!       │  apply to buffer ── out of range ──► Dropped
//!       │  notify editor
//!       ▼
//! guard dropped                     (flag cleared on every path)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::document::DocumentBuffer;
use crate::protocol::{ChangeEnvelope, ChangeEvent};

/// Shared "applying remote changes" flag.
///
/// Cloned into the editor-facing handle so a local-edit report made while a
/// remote change is being applied is recognized as an echo.
#[derive(Debug, Clone, Default)]
pub struct RemoteApplyFlag(Arc<AtomicBool>);

impl RemoteApplyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the flag until the returned guard is dropped.
    pub fn enter(&self) -> ApplyGuard<'_> {
        self.0.store(true, Ordering::Release);
        ApplyGuard { flag: &self.0 }
    }
}

/// Clears the flag on drop, including early returns and unwinding.
#[must_use = "the flag is cleared as soon as the guard is dropped"]
pub struct ApplyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OtherDocument,
    OwnChange,
}

/// Result of handling one inbound change message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(ChangeEvent),
    Ignored(IgnoreReason),
    /// Malformed or inapplicable; the message is discarded.
    Dropped(String),
}

/// Applies inbound change messages for one document on behalf of one user.
#[derive(Debug, Clone)]
pub struct RemoteChangeApplier {
    document_id: String,
    local_user_id: String,
}

impl RemoteChangeApplier {
    pub fn new(document_id: impl Into<String>, local_user_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            local_user_id: local_user_id.into(),
        }
    }

    /// Handle `[documentId, change, senderId]`.
    ///
    /// `on_applied` runs after the buffer is updated and before the guard is
    /// released, so anything it triggers still sees the flag raised.
    pub fn apply<F>(
        &self,
        args: &[Value],
        buffer: &mut DocumentBuffer,
        flag: &RemoteApplyFlag,
        on_applied: F,
    ) -> ApplyOutcome
    where
        F: FnOnce(&ChangeEvent, &DocumentBuffer),
    {
        let envelope = match ChangeEnvelope::decode(args) {
            Ok(envelope) => envelope,
            Err(e) => return ApplyOutcome::Dropped(e.to_string()),
        };
        if envelope.document_id != self.document_id {
            return ApplyOutcome::Ignored(IgnoreReason::OtherDocument);
        }
        if envelope.sender_id == self.local_user_id {
            return ApplyOutcome::Ignored(IgnoreReason::OwnChange);
        }

        let _guard = flag.enter();

        let change = match ChangeEvent::from_value(envelope.change) {
            Ok(change) => change,
            Err(e) => return ApplyOutcome::Dropped(e.to_string()),
        };

        match &change {
            ChangeEvent::FullText { text } => buffer.replace(text),
            ChangeEvent::RangeEdits { edits } => {
                if let Err(e) = buffer.apply(edits) {
                    return ApplyOutcome::Dropped(e.to_string());
                }
            }
            ChangeEvent::LegacySingleEdit(span) => {
                if let Err(e) = buffer.apply(std::slice::from_ref(span)) {
                    return ApplyOutcome::Dropped(e.to_string());
                }
            }
        }

        on_applied(&change, buffer);
        ApplyOutcome::Applied(change)
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }
}
