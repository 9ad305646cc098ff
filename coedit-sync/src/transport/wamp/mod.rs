//! WAMP v2 JSON client over a WebSocket.
//!
//! ```text
//!             ┌──────────── WampSession ────────────┐
//! publish ───►│ outgoing_tx ──► writer task ──► ws  │
//! subscribe ─►│   pending[request] ◄─ SUBSCRIBED ─┐ │
//!             │                                   │ │
//!             │ ws ──► reader task ── EVENT ──────┼─┼──► events (TransportEvent)
//!             │                    └─ GOODBYE/close ─┼──► Closed{reason}
//!             └─────────────────────────────────────┘
//! ```
//!
//! Opening performs the HELLO/WELCOME handshake; an ABORT becomes
//! [`TransportError::Rejected`]. After that every failure is reported as a
//! single `Closed` event on the connection's stream.

pub mod message;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use self::message::{WampMessage, SUBPROTOCOL};
use super::{Connection, Connector, RouterSession, SubscriptionId, TransportError, TransportEvent};

type PendingSubscribe = (String, oneshot::Sender<Result<u64, TransportError>>);

/// Opens WAMP sessions.
#[derive(Debug, Clone)]
pub struct WampConnector {
    open_timeout: Duration,
    request_timeout: Duration,
}

impl Default for WampConnector {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl WampConnector {
    pub fn new(open_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            open_timeout,
            request_timeout,
        }
    }

    async fn handshake(&self, url: &str, realm: &str) -> Result<Connection, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Open(e.to_string()))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        ws_writer
            .send(Message::Text(WampMessage::hello(realm).encode().into()))
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;

        let session_id = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Text(text))) => match WampMessage::decode(text.as_str())? {
                    WampMessage::Welcome { session, .. } => break session,
                    WampMessage::Abort { reason, details } => {
                        let message = details
                            .get("message")
                            .and_then(Value::as_str)
                            .map(|m| format!("{reason}: {m}"))
                            .unwrap_or(reason);
                        return Err(TransportError::Rejected(message));
                    }
                    other => {
                        return Err(TransportError::Malformed(format!(
                            "expected WELCOME, got message code {}",
                            other.code()
                        )))
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Open(e.to_string())),
            }
        };
        log::info!("WAMP session {session_id} established on realm {realm}");

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            outgoing_tx,
            open: AtomicBool::new(true),
            next_request: AtomicU64::new(1),
            pending_subscribes: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
        });

        // Writer task: forward queued frames to the socket
        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if ws_writer.send(frame).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route events and replies
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let (reason, details) = read_loop(&mut ws_reader, &reader_shared, &events_tx).await;
            reader_shared.open.store(false, Ordering::Release);
            for (_, (_, reply)) in reader_shared.pending_subscribes.lock().drain() {
                let _ = reply.send(Err(TransportError::Closed));
            }
            reader_shared.topics.lock().clear();
            log::info!("WAMP session {session_id} closed: {reason}");
            let _ = events_tx.send(TransportEvent::Closed { reason, details });
        });

        Ok(Connection {
            session: Arc::new(WampSession {
                shared,
                session_id,
                request_timeout: self.request_timeout,
            }),
            events: events_rx,
        })
    }
}

#[async_trait::async_trait]
impl Connector for WampConnector {
    async fn open(&self, url: &str, realm: &str) -> Result<Connection, TransportError> {
        tokio::time::timeout(self.open_timeout, self.handshake(url, realm))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

struct Shared {
    outgoing_tx: mpsc::UnboundedSender<Message>,
    open: AtomicBool,
    next_request: AtomicU64,
    /// SUBSCRIBE request id → (topic, reply)
    pending_subscribes: Mutex<HashMap<u64, PendingSubscribe>>,
    /// subscription id → topic
    topics: Mutex<HashMap<u64, String>>,
}

impl Shared {
    fn send(&self, message: &WampMessage) -> Result<(), TransportError> {
        self.outgoing_tx
            .send(Message::Text(message.encode().into()))
            .map_err(|_| TransportError::Closed)
    }
}

type WsReader = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;

/// Drive the socket until the session ends. Returns the close reason.
async fn read_loop(
    ws_reader: &mut WsReader,
    shared: &Shared,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> (String, String) {
    while let Some(frame) = ws_reader.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                let details = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                return ("wamp.close.transport_lost".into(), details);
            }
            Ok(_) => continue,
            Err(e) => {
                log::error!("WAMP socket error: {e}");
                return ("wamp.close.transport_lost".into(), e.to_string());
            }
        };

        let message = match WampMessage::decode(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping undecodable WAMP frame: {e}");
                continue;
            }
        };

        match message {
            WampMessage::Event {
                subscription, args, ..
            } => {
                let topic = shared.topics.lock().get(&subscription).cloned();
                match topic {
                    Some(topic) => {
                        let _ = events_tx.send(TransportEvent::Message { topic, args });
                    }
                    None => log::debug!("Event for unknown subscription {subscription}"),
                }
            }
            WampMessage::Subscribed {
                request,
                subscription,
            } => {
                if let Some((topic, reply)) = shared.pending_subscribes.lock().remove(&request) {
                    shared.topics.lock().insert(subscription, topic);
                    let _ = reply.send(Ok(subscription));
                }
            }
            WampMessage::Error {
                request_type,
                request,
                error,
                ..
            } => {
                if request_type == message::SUBSCRIBE {
                    if let Some((_, reply)) = shared.pending_subscribes.lock().remove(&request) {
                        let _ = reply.send(Err(TransportError::Request(error)));
                        continue;
                    }
                }
                log::warn!("Router error for request {request} (type {request_type}): {error}");
            }
            WampMessage::Published { publication, .. } => {
                log::trace!("Publication {publication} acknowledged");
            }
            WampMessage::Unsubscribed { request } => {
                log::debug!("Unsubscribe {request} confirmed");
            }
            WampMessage::Goodbye { reason, .. } => {
                if shared.open.swap(false, Ordering::AcqRel) {
                    // Router-initiated: answer before closing.
                    let _ = shared.send(&WampMessage::goodbye("wamp.close.goodbye_and_out"));
                }
                let _ = shared.outgoing_tx.send(Message::Close(None));
                return (reason, String::new());
            }
            WampMessage::Abort { reason, details } => {
                return (reason, details.to_string());
            }
            other => {
                log::debug!("Ignoring WAMP message code {}", other.code());
            }
        }
    }
    ("wamp.close.transport_lost".into(), String::new())
}

/// An established WAMP session.
pub struct WampSession {
    shared: Arc<Shared>,
    session_id: u64,
    request_timeout: Duration,
}

impl WampSession {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    fn next_request(&self) -> u64 {
        self.shared.next_request.fetch_add(1, Ordering::Relaxed)
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait::async_trait]
impl RouterSession for WampSession {
    fn publish(&self, topic: &str, args: Vec<Value>) -> Result<(), TransportError> {
        self.check_open()?;
        self.shared.send(&WampMessage::Publish {
            request: self.next_request(),
            options: json!({}),
            topic: topic.to_string(),
            args,
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<SubscriptionId, TransportError> {
        self.check_open()?;
        let request = self.next_request();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending_subscribes
            .lock()
            .insert(request, (topic.to_string(), reply_tx));

        let sent = self.shared.send(&WampMessage::Subscribe {
            request,
            options: json!({}),
            topic: topic.to_string(),
        });
        if let Err(e) = sent {
            self.shared.pending_subscribes.lock().remove(&request);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result.map(SubscriptionId),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.shared.pending_subscribes.lock().remove(&request);
                Err(TransportError::Timeout)
            }
        }
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        self.check_open()?;
        self.shared.topics.lock().remove(&id.0);
        self.shared.send(&WampMessage::Unsubscribe {
            request: self.next_request(),
            subscription: id.0,
        })
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            let _ = self.shared.send(&WampMessage::goodbye("wamp.close.close_realm"));
            let _ = self.shared.outgoing_tx.send(Message::Close(None));
        }
    }
}

impl Drop for WampSession {
    fn drop(&mut self) {
        self.close();
    }
}
