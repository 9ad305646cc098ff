//! # coedit-sync — Real-time synchronization core for a collaborative code editor
//!
//! Keeps one document consistent across every client editing it: local
//! edits fan out as range edits over a pub/sub router, remote edits are
//! applied without echoing back, presence is tracked per document, and
//! content is saved to the storage service after a quiet period.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  SyncHandle   ┌──────────────────────┐   WAMP (pub/sub)   ┌────────┐
//! │  editor  │ ────────────► │  SyncSession actor   │ ◄────────────────► │ router │
//! │          │ ◄──────────── │                      │                    └────────┘
//! └──────────┘  SyncEvent    │  ChangeBroadcaster   │
//!                            │  RemoteChangeApplier │   REST (bearer)    ┌─────────┐
//!                            │  PresenceTracker     │ ◄────────────────► │ storage │
//!                            │  PersistenceScheduler│                    └─────────┘
//!                            └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Topics and positional message payloads
//! - [`document`] — Document metadata and the rope-backed buffer
//! - [`presence`] — Who else is editing, and where their cursor is
//! - [`broadcast`] — Outbound change, cursor and presence publications
//! - [`applier`] — Inbound change application with echo suppression
//! - [`persistence`] — Debounced saving with retry and safety sweep
//! - [`session`] — Per-document session actor and editor handle
//! - [`transport`] — Router capability, WAMP client, in-memory router
//! - [`storage`] — Storage service trait, REST client, in-memory store
//! - [`auth`] — Explicit identity and bearer token
//! - [`config`] — Session configuration and retry policies
//! - [`broker`] — Minimal WAMP broker for development

pub mod applier;
pub mod auth;
pub mod broadcast;
pub mod broker;
pub mod config;
pub mod document;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use applier::{ApplyOutcome, IgnoreReason, RemoteApplyFlag, RemoteChangeApplier};
pub use auth::{AccessToken, AuthError, AuthSession, PasswordGrant, TokenRefresher, UserIdentity};
pub use broadcast::{ChangeBroadcaster, Publication, Suppressed};
pub use broker::{Broker, BrokerConfig, BrokerError, BrokerStats};
pub use config::{ConfigError, RetryPolicy, SyncConfig};
pub use document::{Document, DocumentBuffer, EditError};
pub use persistence::{PersistenceScheduler, SaveStatus};
pub use presence::{PresenceRecord, PresenceTracker};
pub use protocol::{ChangeEvent, CursorUpdate, EditSpan, PresenceUser, ProtocolError, TopicKind};
pub use session::{
    EditorSurface, SessionError, SessionSnapshot, SessionState, SyncEvent, SyncHandle, SyncSession,
};
pub use storage::{StorageError, StorageService};
pub use transport::{Connection, Connector, RouterSession, TransportError, TransportEvent};
