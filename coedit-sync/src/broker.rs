//! Minimal WAMP v2 broker for local development and socket-level tests.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── topic code.document.7.changed ──► subscribers
//!             ├── session (HELLO/WELCOME) ┤
//! Client B ──┘                         └── topic code.user.joined ─────────► subscribers
//! ```
//!
//! Pub/sub roles only: no RPC, no authentication, no pattern subscriptions.
//! A publisher is excluded from its own events unless it publishes with
//! `exclude_me: false`, and receives `PUBLISHED` only when it asks for
//! `acknowledge: true`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::transport::wamp::message::{self, option_flag, WampMessage, SUBPROTOCOL};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// The only realm clients may join
    pub realm: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            realm: "realm1".to_string(),
        }
    }
}

/// Broker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub published: u64,
    pub delivered: u64,
    pub active_topics: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

struct Topic {
    subscription: u64,
    subscribers: HashSet<u64>,
}

/// Sessions and topic subscriptions. Every operation is synchronous; frames
/// are queued on each session's outgoing channel.
#[derive(Default)]
pub struct BrokerState {
    sessions: HashMap<u64, mpsc::UnboundedSender<Message>>,
    topics: HashMap<String, Topic>,
    /// subscription id → topic
    subscriptions: HashMap<u64, String>,
    next_id: u64,
    stats: BrokerStats,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Register a session and return its id.
    pub fn join(&mut self, outgoing: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id();
        self.sessions.insert(id, outgoing);
        self.stats.total_sessions += 1;
        self.stats.active_sessions += 1;
        id
    }

    /// Subscribe `session` to `topic`. All subscribers of a topic share one
    /// subscription id.
    pub fn subscribe(&mut self, session: u64, topic: &str) -> u64 {
        if !self.topics.contains_key(topic) {
            let subscription = self.next_id();
            self.subscriptions.insert(subscription, topic.to_string());
            self.topics.insert(
                topic.to_string(),
                Topic {
                    subscription,
                    subscribers: HashSet::new(),
                },
            );
        }
        let entry = self
            .topics
            .get_mut(topic)
            .map(|t| {
                t.subscribers.insert(session);
                t.subscription
            })
            .unwrap_or_default();
        self.stats.active_topics = self.topics.len();
        entry
    }

    /// Returns false if `session` did not hold `subscription`.
    pub fn unsubscribe(&mut self, session: u64, subscription: u64) -> bool {
        let Some(topic) = self.subscriptions.get(&subscription).cloned() else {
            return false;
        };
        let removed = match self.topics.get_mut(&topic) {
            Some(t) => t.subscribers.remove(&session),
            None => false,
        };
        self.drop_if_empty(&topic);
        removed
    }

    /// Deliver an EVENT to every subscriber of `topic`. Returns the
    /// publication id and the number of deliveries.
    pub fn publish(&mut self, publisher: u64, topic: &str, args: Vec<Value>, exclude_me: bool) -> (u64, usize) {
        let publication = self.next_id();
        self.stats.published += 1;
        let Some(entry) = self.topics.get(topic) else {
            return (publication, 0);
        };

        let frame = WampMessage::Event {
            subscription: entry.subscription,
            publication,
            details: json!({}),
            args,
        }
        .encode();

        let mut delivered = 0;
        for subscriber in &entry.subscribers {
            if exclude_me && *subscriber == publisher {
                continue;
            }
            if let Some(tx) = self.sessions.get(subscriber) {
                if tx.send(Message::Text(frame.clone().into())).is_ok() {
                    delivered += 1;
                }
            }
        }
        self.stats.delivered += delivered as u64;
        (publication, delivered)
    }

    /// Remove a session and all of its subscriptions.
    pub fn leave(&mut self, session: u64) {
        if self.sessions.remove(&session).is_none() {
            return;
        }
        self.stats.active_sessions = self.stats.active_sessions.saturating_sub(1);
        let topics: Vec<String> = self
            .topics
            .iter_mut()
            .filter_map(|(name, t)| t.subscribers.remove(&session).then(|| name.clone()))
            .collect();
        for topic in topics {
            self.drop_if_empty(&topic);
        }
    }

    fn drop_if_empty(&mut self, topic: &str) {
        if let Some(t) = self.topics.get(topic) {
            if t.subscribers.is_empty() {
                self.subscriptions.remove(&t.subscription);
                self.topics.remove(topic);
            }
        }
        self.stats.active_topics = self.topics.len();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |t| t.subscribers.len())
    }

    pub fn stats(&self) -> BrokerStats {
        self.stats.clone()
    }
}

/// The broker.
#[derive(Clone)]
pub struct Broker {
    config: BrokerConfig,
    state: Arc<Mutex<BrokerState>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BrokerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "WAMP broker listening on {} (realm {})",
            self.config.bind_addr,
            self.config.realm
        );
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            let realm = self.config.realm.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, state, realm).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state.lock().subscriber_count(topic)
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Echo the WAMP subprotocol when the client offers it.
#[allow(clippy::result_large_err)]
fn negotiate(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == SUBPROTOCOL);
    if offered {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    }
    Ok(response)
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    realm: String,
) -> Result<(), BrokerError> {
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, negotiate).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::debug!("WebSocket connection established from {addr}");

    // HELLO must come first
    let requested = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => match WampMessage::decode(text.as_str()) {
                Ok(WampMessage::Hello { realm, .. }) => break realm,
                Ok(other) => {
                    log::warn!("{addr} sent message code {} before HELLO", other.code());
                    let abort = WampMessage::abort("wamp.error.protocol_violation", "expected HELLO");
                    ws_sender.send(Message::Text(abort.encode().into())).await?;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Failed to decode message from {addr}: {e}");
                    return Ok(());
                }
            },
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    };

    if requested != realm {
        log::warn!("{addr} asked for unknown realm {requested}");
        let abort = WampMessage::abort("wamp.error.no_such_realm", format!("realm {requested} does not exist"));
        ws_sender.send(Message::Text(abort.encode().into())).await?;
        let _ = ws_sender.close().await;
        return Ok(());
    }

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
    let session = state.lock().join(outgoing_tx.clone());
    let welcome = WampMessage::Welcome {
        session,
        details: json!({
            "agent": concat!("coedit-broker/", env!("CARGO_PKG_VERSION")),
            "roles": { "broker": {} }
        }),
    };
    ws_sender.send(Message::Text(welcome.encode().into())).await?;
    log::info!("Session {session} joined realm {realm} from {addr}");

    let result = session_loop(
        session,
        &state,
        &outgoing_tx,
        &mut outgoing_rx,
        &mut ws_sender,
        &mut ws_receiver,
    )
    .await;

    // Cleanup
    state.lock().leave(session);
    log::info!("Session {session} left");
    result
}

type WsSender = futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>;
type WsReceiver = futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

async fn session_loop(
    session: u64,
    state: &Mutex<BrokerState>,
    outgoing_tx: &mpsc::UnboundedSender<Message>,
    outgoing_rx: &mut mpsc::UnboundedReceiver<Message>,
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
) -> Result<(), BrokerError> {
    let reply = |message: WampMessage| {
        let _ = outgoing_tx.send(Message::Text(message.encode().into()));
    };

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Session {session} closed its socket");
                        return Ok(());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };

                let message = match WampMessage::decode(text.as_str()) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Session {session} sent an undecodable frame: {e}");
                        continue;
                    }
                };

                match message {
                    WampMessage::Subscribe { request, topic, .. } => {
                        let subscription = state.lock().subscribe(session, &topic);
                        log::debug!("Session {session} subscribed to {topic}");
                        reply(WampMessage::Subscribed { request, subscription });
                    }
                    WampMessage::Unsubscribe { request, subscription } => {
                        if state.lock().unsubscribe(session, subscription) {
                            reply(WampMessage::Unsubscribed { request });
                        } else {
                            reply(WampMessage::Error {
                                request_type: message::UNSUBSCRIBE,
                                request,
                                details: json!({}),
                                error: "wamp.error.no_such_subscription".to_string(),
                            });
                        }
                    }
                    WampMessage::Publish { request, options, topic, args } => {
                        let exclude_me = option_flag(&options, "exclude_me").unwrap_or(true);
                        let (publication, delivered) = state.lock().publish(session, &topic, args, exclude_me);
                        log::trace!("Session {session} published to {topic} ({delivered} deliveries)");
                        if option_flag(&options, "acknowledge") == Some(true) {
                            reply(WampMessage::Published { request, publication });
                        }
                    }
                    WampMessage::Goodbye { reason, .. } => {
                        log::debug!("Session {session} said goodbye: {reason}");
                        let goodbye = WampMessage::goodbye("wamp.close.goodbye_and_out");
                        ws_sender.send(Message::Text(goodbye.encode().into())).await?;
                        let _ = ws_sender.close().await;
                        return Ok(());
                    }
                    WampMessage::Hello { .. } => {
                        let abort = WampMessage::abort("wamp.error.protocol_violation", "HELLO received twice");
                        ws_sender.send(Message::Text(abort.encode().into())).await?;
                        return Ok(());
                    }
                    other => {
                        log::debug!("Unhandled message code {} from session {session}", other.code());
                    }
                }
            }

            frame = outgoing_rx.recv() => {
                match frame {
                    Some(frame) => ws_sender.send(frame).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}
