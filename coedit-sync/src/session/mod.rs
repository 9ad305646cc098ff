//! Per-document sync session: connection, presence, edits and saving.
//!
//! [`SyncSession::spawn`] starts one actor task per open document and
//! returns a [`SyncHandle`]. The editor reports local activity through the
//! handle and receives [`SyncEvent`]s through its [`EditorSurface`].
//!
//! ```text
//!   editor ──local_edit/cursor──► SyncHandle ──► actor task ──► router
//!     ▲                                              │  ▲
//!     └──────────── EditorSurface::notify ◄──────────┘  └── storage
//! ```

mod actor;

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot, watch};

pub use actor::SessionEvent;
use actor::{Command, SessionActor};

use crate::applier::RemoteApplyFlag;
use crate::auth::{AuthSession, UserIdentity};
use crate::config::SyncConfig;
use crate::document::Document;
use crate::persistence::SaveStatus;
use crate::presence::PresenceRecord;
use crate::protocol::{ChangeEvent, CursorUpdate, EditSpan, PresenceUser};
use crate::storage::http::HttpStorage;
use crate::storage::{StorageError, StorageService};
use crate::transport::wamp::WampConnector;
use crate::transport::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Torn down; the handle no longer does anything.
    Closed,
}

/// Notifications for the editor.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ConnectionChanged(bool),
    /// Authoritative content arrived. Raised while the remote-apply flag is
    /// set, so setting the editor text does not echo back.
    DocumentLoaded(Document),
    LoadFailed(StorageError),
    /// A peer's change was applied. `content` is the resulting text.
    RemoteChange { change: ChangeEvent, content: String },
    PresenceChanged(Vec<PresenceRecord>),
    CursorMoved(CursorUpdate),
    SaveStatus(SaveStatus),
}

/// Where the session delivers [`SyncEvent`]s.
///
/// Called on the session task; implementations must not block.
pub trait EditorSurface: Send + 'static {
    fn notify(&self, event: SyncEvent);
}

impl EditorSurface for mpsc::UnboundedSender<SyncEvent> {
    fn notify(&self, event: SyncEvent) {
        let _ = self.send(event);
    }
}

impl<F> EditorSurface for F
where
    F: Fn(SyncEvent) + Send + 'static,
{
    fn notify(&self, event: SyncEvent) {
        self(event)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub loaded: bool,
    pub content: String,
    pub peers: Vec<PresenceRecord>,
    pub save_status: SaveStatus,
    pub has_pending_changes: bool,
    pub last_saved_at: Option<SystemTime>,
    pub subscriptions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Reported while a remote change was being applied; treated as an echo.
    #[error("edit reported while applying a remote change")]
    ApplyingRemote,
    #[error("session is closed")]
    Closed,
}

/// Editor-side handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct SyncHandle {
    document_id: String,
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    applying_remote: RemoteApplyFlag,
    state: watch::Receiver<SessionState>,
}

impl SyncHandle {
    /// Report a local edit transaction. Edits made while a remote change is
    /// being applied are dropped here and never reach the router.
    pub fn local_edit(&self, spans: Vec<EditSpan>) -> Result<(), SessionError> {
        if self.applying_remote.is_set() {
            return Err(SessionError::ApplyingRemote);
        }
        self.commands
            .send(Command::LocalEdit(spans))
            .map_err(|_| SessionError::Closed)
    }

    pub fn cursor_moved(&self, position: usize) -> Result<(), SessionError> {
        self.commands
            .send(Command::Cursor(position))
            .map_err(|_| SessionError::Closed)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`. Returns `false` if the
    /// session ended first.
    pub async fn wait_for_state(&self, target: SessionState) -> bool {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|state| *state == target).await.is_ok();
        reached
    }

    /// Leave the document: unsubscribe, announce departure, close the
    /// connection and flush unsaved content. Resolves once done.
    pub async fn teardown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Teardown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True while a remote change is being applied to the editor.
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.is_set()
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("document_id", &self.document_id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

pub struct SyncSession;

impl SyncSession {
    /// Start a session for `document_id` on the current tokio runtime.
    pub fn spawn(
        config: SyncConfig,
        document_id: impl Into<String>,
        identity: &UserIdentity,
        connector: Arc<dyn Connector>,
        storage: Arc<dyn StorageService>,
        editor: impl EditorSurface,
    ) -> SyncHandle {
        let document_id = document_id.into();
        let session_id = uuid::Uuid::new_v4().to_string();
        let tag = format!("{}:{}", document_id, &session_id[..8]);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let applying_remote = RemoteApplyFlag::new();

        let actor = SessionActor::new(
            tag,
            config,
            document_id.clone(),
            PresenceUser::new(identity.id.clone(), identity.username.clone()),
            connector,
            storage,
            Box::new(editor),
            applying_remote.clone(),
            internal_tx,
            state_tx,
        );
        tokio::spawn(actor.run(command_rx, internal_rx));

        SyncHandle {
            document_id,
            session_id,
            commands: command_tx,
            applying_remote,
            state: state_rx,
        }
    }

    /// Start a session against the REST storage service and a WAMP router,
    /// both taken from `config`.
    pub fn connect(
        config: SyncConfig,
        document_id: impl Into<String>,
        auth: Arc<AuthSession>,
        editor: impl EditorSurface,
    ) -> Result<SyncHandle, StorageError> {
        let identity = auth.user().clone();
        let storage = HttpStorage::with_timeout(config.api_url.clone(), auth, config.request_timeout)?;
        let connector = WampConnector::new(config.open_timeout, config.request_timeout);
        Ok(Self::spawn(
            config,
            document_id,
            &identity,
            Arc::new(connector),
            Arc::new(storage),
            editor,
        ))
    }
}
