//! In-process router.
//!
//! Every session opened through [`MemoryRouter::connector`] shares one topic
//! table. Publications are delivered to every subscriber of the topic,
//! including the publishing session itself, so self-suppression on the
//! receiving side is always exercised.
//!
//! The router also records everything published and exposes fault knobs
//! (refused opens, close-on-open, dropping all sessions) for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Connection, Connector, RouterSession, SubscriptionId, TransportError, TransportEvent};
use crate::broadcast::Publication;

#[derive(Default)]
struct RouterState {
    next_id: u64,
    sessions: HashMap<u64, mpsc::UnboundedSender<TransportEvent>>,
    /// subscription id → (session id, topic)
    subscriptions: HashMap<u64, (u64, String)>,
    published: Vec<Publication>,
    open_attempts: usize,
    refuse_opens: usize,
    close_on_open: bool,
}

impl RouterState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn deliver(&mut self, topic: &str, args: &[Value]) {
        for (session, sub_topic) in self.subscriptions.values() {
            if sub_topic != topic {
                continue;
            }
            if let Some(tx) = self.sessions.get(session) {
                let _ = tx.send(TransportEvent::Message {
                    topic: topic.to_string(),
                    args: args.to_vec(),
                });
            }
        }
        self.published.push(Publication {
            topic: topic.to_string(),
            args: args.to_vec(),
        });
    }

    fn drop_session(&mut self, session: u64, reason: &str) {
        self.subscriptions.retain(|_, (owner, _)| *owner != session);
        if let Some(tx) = self.sessions.remove(&session) {
            let _ = tx.send(TransportEvent::Closed {
                reason: reason.to_string(),
                details: String::new(),
            });
        }
    }
}

/// Shared in-memory topic table.
#[derive(Clone, Default)]
pub struct MemoryRouter {
    state: Arc<Mutex<RouterState>>,
}

impl MemoryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            router: self.clone(),
        }
    }

    /// Publish as an external peer with no session of its own.
    pub fn publish(&self, topic: &str, args: Vec<Value>) {
        self.state.lock().deliver(topic, &args);
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<Publication> {
        self.state.lock().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Publication> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.state.lock().published.clear();
    }

    /// Live subscriptions across all sessions.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn open_attempts(&self) -> usize {
        self.state.lock().open_attempts
    }

    /// Fail the next `n` open attempts.
    pub fn refuse_next_opens(&self, n: usize) {
        self.state.lock().refuse_opens = n;
    }

    /// Close every new session right after it opens.
    pub fn set_close_on_open(&self, enabled: bool) {
        self.state.lock().close_on_open = enabled;
    }

    /// Close every open session, as if the router went down.
    pub fn drop_all(&self, reason: &str) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            state.drop_session(id, reason);
        }
    }
}

impl std::fmt::Debug for MemoryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryRouter")
            .field("sessions", &state.sessions.len())
            .field("subscriptions", &state.subscriptions.len())
            .field("published", &state.published.len())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct MemoryConnector {
    router: MemoryRouter,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &str, realm: &str) -> Result<Connection, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.router.state.lock();
        state.open_attempts += 1;
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            return Err(TransportError::Open(format!("{url} refused connection")));
        }

        let id = state.next_id();
        state.sessions.insert(id, tx);
        let close_now = state.close_on_open;
        if close_now {
            state.drop_session(id, "wamp.close.system_shutdown");
        }
        drop(state);

        log::debug!("Memory session {id} opened on realm {realm}");
        let session = MemorySession {
            router: self.router.clone(),
            id,
            open: AtomicBool::new(!close_now),
        };
        Ok(Connection {
            session: Arc::new(session),
            events: rx,
        })
    }
}

pub struct MemorySession {
    router: MemoryRouter,
    id: u64,
    open: AtomicBool,
}

impl MemorySession {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait::async_trait]
impl RouterSession for MemorySession {
    fn publish(&self, topic: &str, args: Vec<Value>) -> Result<(), TransportError> {
        self.check_open()?;
        self.router.state.lock().deliver(topic, &args);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<SubscriptionId, TransportError> {
        self.check_open()?;
        let mut state = self.router.state.lock();
        let id = state.next_id();
        state.subscriptions.insert(id, (self.id, topic.to_string()));
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.router.state.lock();
        match state.subscriptions.get(&id.0) {
            Some((owner, _)) if *owner == self.id => {
                state.subscriptions.remove(&id.0);
                Ok(())
            }
            _ => Err(TransportError::Request("wamp.error.no_such_subscription".into())),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.router.state.lock().sessions.contains_key(&self.id)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.router
                .state
                .lock()
                .drop_session(self.id, "wamp.close.normal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_including_self() {
        let router = MemoryRouter::new();
        let mut a = router.connector().open("mem://", "realm1").await.unwrap();
        let mut b = router.connector().open("mem://", "realm1").await.unwrap();
        a.session.subscribe("t").await.unwrap();
        b.session.subscribe("t").await.unwrap();

        a.session.publish("t", vec![json!(1)]).unwrap();

        for conn in [&mut a, &mut b] {
            assert_eq!(
                conn.events.recv().await.unwrap(),
                TransportEvent::Message {
                    topic: "t".into(),
                    args: vec![json!(1)]
                }
            );
        }
        assert_eq!(router.published().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let router = MemoryRouter::new();
        let mut conn = router.connector().open("mem://", "realm1").await.unwrap();
        let id = conn.session.subscribe("t").await.unwrap();
        conn.session.unsubscribe(id).unwrap();
        assert_eq!(router.subscription_count(), 0);

        router.publish("t", vec![]);
        assert!(conn.events.try_recv().is_err());
        assert!(conn.session.unsubscribe(id).is_err());
    }

    #[tokio::test]
    async fn test_close_drops_subscriptions() {
        let router = MemoryRouter::new();
        let mut conn = router.connector().open("mem://", "realm1").await.unwrap();
        conn.session.subscribe("a").await.unwrap();
        conn.session.subscribe("b").await.unwrap();
        assert_eq!(router.subscription_count(), 2);

        conn.session.close();
        assert!(!conn.session.is_open());
        assert_eq!(router.subscription_count(), 0);
        assert_eq!(router.session_count(), 0);
        assert!(matches!(conn.events.recv().await, Some(TransportEvent::Closed { .. })));
        assert_eq!(conn.session.publish("a", vec![]), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_refused_and_closing_opens() {
        let router = MemoryRouter::new();
        router.refuse_next_opens(1);
        assert!(router.connector().open("mem://", "realm1").await.is_err());

        router.set_close_on_open(true);
        let mut conn = router.connector().open("mem://", "realm1").await.unwrap();
        assert!(!conn.session.is_open());
        assert!(matches!(conn.events.recv().await, Some(TransportEvent::Closed { .. })));
        assert!(conn.session.subscribe("t").await.is_err());
        assert_eq!(router.open_attempts(), 2);
    }

    #[tokio::test]
    async fn test_drop_all() {
        let router = MemoryRouter::new();
        let mut conn = router.connector().open("mem://", "realm1").await.unwrap();
        router.drop_all("router restart");
        assert_eq!(
            conn.events.recv().await,
            Some(TransportEvent::Closed {
                reason: "router restart".into(),
                details: String::new()
            })
        );
        assert!(!conn.session.is_open());
    }
}
