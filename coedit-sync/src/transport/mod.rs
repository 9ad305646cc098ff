//! Router capability: the narrow pub/sub surface the session depends on.
//!
//! ```text
//! Connector::open(url, realm) ──► Connection
//!                                   ├── session: Arc<dyn RouterSession>
//!                                   │     publish / subscribe / unsubscribe / close
//!                                   └── events: Message{topic, args} ... Closed{reason}
//! ```
//!
//! Two implementations: [`wamp`] speaks WAMP v2 JSON over a WebSocket, and
//! [`memory`] is an in-process router for tests and local tooling.

pub mod memory;
pub mod wamp;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

/// Router-assigned subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Inbound traffic on an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An event published on a topic this session subscribed to.
    Message { topic: String, args: Vec<Value> },
    /// The connection is gone. Always the last event.
    Closed { reason: String, details: String },
}

/// An open router session.
#[async_trait::async_trait]
pub trait RouterSession: Send + Sync {
    /// Fire-and-forget publish.
    fn publish(&self, topic: &str, args: Vec<Value>) -> Result<(), TransportError>;

    /// Subscribe to a topic. Matching messages arrive on the connection's
    /// event stream.
    async fn subscribe(&self, topic: &str) -> Result<SubscriptionId, TransportError>;

    /// Drop a subscription. Best-effort: the router's reply is not awaited.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Leave the realm and close the socket. Idempotent.
    fn close(&self);
}

/// An open session and the stream of its inbound events.
pub struct Connection {
    pub session: Arc<dyn RouterSession>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.session.is_open())
            .finish()
    }
}

/// Opens router sessions. Opening never retries; the caller owns retry.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str, realm: &str) -> Result<Connection, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open connection: {0}")]
    Open(String),
    #[error("router rejected the session: {0}")]
    Rejected(String),
    #[error("connection closed")]
    Closed,
    #[error("router did not answer in time")]
    Timeout,
    #[error("router error: {0}")]
    Request(String),
    #[error("malformed router message: {0}")]
    Malformed(String),
}
