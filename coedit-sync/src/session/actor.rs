//! The session actor: one task that owns a document and its connection.
//!
//! Every input is a typed [`SessionEvent`] handled by [`SessionActor::dispatch`].
//! Network calls run in spawned tasks and report back through the internal
//! channel tagged with the connection generation that issued them, so a
//! reply from a connection that has since closed is ignored.
//!
//! ```text
//!              Connect                  Opened(Ok)
//! Disconnected ───────► Connecting ────────────────► Connected
//!      ▲                    │ Opened(Err)                │ Transport(Closed)
//!      │                    ▼                            ▼
//!      └──── reconnect_at ◄─┴────────────────────── unsubscribe, user.left,
//!            (fixed 5 s)                              final save if dirty
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{EditorSurface, SessionSnapshot, SessionState, SyncEvent};
use crate::applier::{ApplyOutcome, RemoteApplyFlag, RemoteChangeApplier};
use crate::broadcast::{ChangeBroadcaster, Publication};
use crate::config::SyncConfig;
use crate::document::{Document, DocumentBuffer};
use crate::persistence::{PersistenceScheduler, SaveStatus, SaveTicket};
use crate::presence::PresenceTracker;
use crate::protocol::{decode_presence, CursorUpdate, EditSpan, PresenceUser, TopicKind};
use crate::storage::{StorageError, StorageService};
use crate::transport::{
    Connection, Connector, RouterSession, SubscriptionId, TransportError, TransportEvent,
};

/// Requests from a [`super::SyncHandle`].
pub(crate) enum Command {
    LocalEdit(Vec<EditSpan>),
    Cursor(usize),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Teardown(oneshot::Sender<()>),
}

/// Everything the session reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    /// Open a new connection (initial connect or reconnect timer).
    Connect,
    Opened {
        generation: u64,
        result: Result<Connection, TransportError>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Subscribed {
        generation: u64,
        kind: TopicKind,
        result: Result<SubscriptionId, TransportError>,
    },
    Fetched {
        generation: u64,
        result: Result<Document, StorageError>,
    },
    SaveFinished {
        ticket: SaveTicket,
        result: Result<(), StorageError>,
    },
    LocalEdit(Vec<EditSpan>),
    LocalCursor(usize),
    /// A timer deadline passed.
    Tick(Instant),
}

pub(crate) struct SessionActor {
    tag: String,
    config: SyncConfig,
    document_id: String,
    connector: Arc<dyn Connector>,
    storage: Arc<dyn StorageService>,
    editor: Box<dyn EditorSurface>,
    internal_tx: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,

    // Connection
    state: SessionState,
    generation: u64,
    router: Option<Arc<dyn RouterSession>>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    subscriptions: Vec<(TopicKind, SubscriptionId)>,
    pending_subscribes: usize,
    fetch_settled: bool,
    /// Document fetched on the current connection; gates publishing.
    fetched: bool,
    announced: bool,

    // Document
    loaded: bool,
    buffer: DocumentBuffer,
    presence: PresenceTracker,
    broadcaster: ChangeBroadcaster,
    applier: RemoteChangeApplier,
    applying_remote: RemoteApplyFlag,
    persistence: PersistenceScheduler,
    save_status: SaveStatus,

    // Timers
    keepalive_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tag: String,
        config: SyncConfig,
        document_id: String,
        user: PresenceUser,
        connector: Arc<dyn Connector>,
        storage: Arc<dyn StorageService>,
        editor: Box<dyn EditorSurface>,
        applying_remote: RemoteApplyFlag,
        internal_tx: mpsc::UnboundedSender<SessionEvent>,
        state_tx: watch::Sender<SessionState>,
    ) -> Self {
        let persistence = PersistenceScheduler::new(
            config.debounce,
            config.save_retry.clone(),
            config.sweep_interval,
        );
        Self {
            tag,
            presence: PresenceTracker::new(user.id.clone()),
            applier: RemoteChangeApplier::new(document_id.clone(), user.id.clone()),
            broadcaster: ChangeBroadcaster::new(document_id.clone(), user),
            config,
            document_id,
            connector,
            storage,
            editor,
            internal_tx,
            state_tx,
            state: SessionState::Disconnected,
            generation: 0,
            router: None,
            transport_events: None,
            subscriptions: Vec::new(),
            pending_subscribes: 0,
            fetch_settled: false,
            fetched: false,
            announced: false,
            loaded: false,
            buffer: DocumentBuffer::default(),
            applying_remote,
            persistence,
            save_status: SaveStatus::Saved,
            keepalive_at: None,
            reconnect_at: None,
            reconnect_attempt: 0,
        }
    }

    /// Event loop. Returns after teardown.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        self.persistence.start(Instant::now());
        self.dispatch(SessionEvent::Connect);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::LocalEdit(spans)) => self.dispatch(SessionEvent::LocalEdit(spans)),
                    Some(Command::Cursor(position)) => self.dispatch(SessionEvent::LocalCursor(position)),
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Command::Teardown(done)) => {
                        self.teardown(&mut internal).await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        // Every handle dropped
                        self.teardown(&mut internal).await;
                        return;
                    }
                },
                Some(event) = internal.recv() => self.dispatch(event),
                event = next_transport_event(&mut self.transport_events) => {
                    let generation = self.generation;
                    self.dispatch(SessionEvent::Transport { generation, event });
                }
                _ = sleep_until(deadline) => self.dispatch(SessionEvent::Tick(Instant::now())),
            }
        }
    }

    /// Single entry point for every state transition.
    pub(crate) fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connect => self.on_connect(),
            SessionEvent::Opened { generation, result } => self.on_opened(generation, result),
            SessionEvent::Transport { generation, event } => {
                if generation != self.generation {
                    return;
                }
                match event {
                    TransportEvent::Message { topic, args } => self.on_message(&topic, &args),
                    TransportEvent::Closed { reason, details } => self.on_closed(&reason, &details),
                }
            }
            SessionEvent::Subscribed {
                generation,
                kind,
                result,
            } => self.on_subscribed(generation, kind, result),
            SessionEvent::Fetched { generation, result } => self.on_fetched(generation, result),
            SessionEvent::SaveFinished { ticket, result } => self.on_save_finished(ticket, result),
            SessionEvent::LocalEdit(spans) => self.on_local_edit(spans),
            SessionEvent::LocalCursor(position) => self.on_local_cursor(position),
            SessionEvent::Tick(now) => self.on_tick(now),
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ───────────────────────────────────────────────────────────────────

    fn on_connect(&mut self) {
        if self.state != SessionState::Disconnected {
            log::debug!("[{}] Connect ignored in state {:?}", self.tag, self.state);
            return;
        }
        self.generation += 1;
        self.set_state(SessionState::Connecting);
        log::info!(
            "[{}] Connecting to {} (realm {}, attempt {})",
            self.tag,
            self.config.router_url,
            self.config.realm,
            self.reconnect_attempt + 1
        );

        let generation = self.generation;
        let connector = self.connector.clone();
        let url = self.config.router_url.clone();
        let realm = self.config.realm.clone();
        let open_timeout = self.config.open_timeout;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(open_timeout, connector.open(&url, &realm)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };
            // Session gone: don't leak the connection
            if let Err(mpsc::error::SendError(SessionEvent::Opened {
                result: Ok(connection),
                ..
            })) = tx.send(SessionEvent::Opened { generation, result })
            {
                connection.session.close();
            }
        });
    }

    fn on_opened(&mut self, generation: u64, result: Result<Connection, TransportError>) {
        if generation != self.generation || self.state != SessionState::Connecting {
            if let Ok(connection) = result {
                connection.session.close();
            }
            return;
        }

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                log::warn!("[{}] Connection failed: {e}", self.tag);
                self.set_state(SessionState::Disconnected);
                self.schedule_reconnect(Instant::now());
                return;
            }
        };

        log::info!("[{}] Connected", self.tag);
        let router = connection.session;
        self.router = Some(router.clone());
        self.transport_events = Some(connection.events);
        self.reconnect_attempt = 0;
        self.fetch_settled = false;
        self.fetched = false;
        self.announced = false;
        self.set_state(SessionState::Connected);
        self.editor.notify(SyncEvent::ConnectionChanged(true));

        // Authoritative pull
        let storage = self.storage.clone();
        let document_id = self.document_id.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = storage.fetch(&document_id).await;
            let _ = tx.send(SessionEvent::Fetched { generation, result });
        });

        self.pending_subscribes = TopicKind::SUBSCRIBED.len();
        for kind in TopicKind::SUBSCRIBED {
            let router = router.clone();
            let topic = kind.topic(&self.document_id);
            let request_timeout = self.config.request_timeout;
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = match tokio::time::timeout(request_timeout, router.subscribe(&topic)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                };
                let _ = tx.send(SessionEvent::Subscribed {
                    generation,
                    kind,
                    result,
                });
            });
        }

        self.keepalive_at = self.keepalive_after(Instant::now());
    }

    fn on_subscribed(
        &mut self,
        generation: u64,
        kind: TopicKind,
        result: Result<SubscriptionId, TransportError>,
    ) {
        if generation != self.generation || self.router.is_none() {
            return;
        }
        self.pending_subscribes = self.pending_subscribes.saturating_sub(1);
        match result {
            Ok(id) => self.subscriptions.push((kind, id)),
            Err(e) => log::warn!(
                "[{}] Subscription to {} failed: {e}",
                self.tag,
                kind.topic(&self.document_id)
            ),
        }
        self.maybe_announce();
    }

    fn on_fetched(&mut self, generation: u64, result: Result<Document, StorageError>) {
        if generation != self.generation || self.router.is_none() {
            log::debug!("[{}] Discarding fetch from an earlier connection", self.tag);
            return;
        }
        self.fetch_settled = true;
        match result {
            Ok(document) => {
                log::info!(
                    "[{}] Loaded document ({} chars)",
                    self.tag,
                    document.content.chars().count()
                );
                self.buffer.replace(&document.content);
                self.fetched = true;
                self.loaded = true;
                // Setting editor content must not echo back as a local edit
                let _guard = self.applying_remote.enter();
                self.editor.notify(SyncEvent::DocumentLoaded(document));
            }
            Err(e) => {
                log::warn!("[{}] Failed to load document: {e}", self.tag);
                self.editor.notify(SyncEvent::LoadFailed(e));
            }
        }
        self.maybe_announce();
    }

    /// Announce presence once the document is loaded and every subscription
    /// has settled, so a peer's catch-up snapshot lands on a live
    /// subscription and after the authoritative pull.
    fn maybe_announce(&mut self) {
        if self.announced || !self.fetch_settled || self.pending_subscribes > 0 {
            return;
        }
        self.announced = true;
        let publication = self.broadcaster.joined();
        self.publish(&publication);
    }

    fn on_closed(&mut self, reason: &str, details: &str) {
        if self.state == SessionState::Disconnected || self.state == SessionState::Closed {
            return;
        }
        log::info!("[{}] Connection closed: {reason} {details}", self.tag);
        let was_connected = self.state == SessionState::Connected;

        self.release_connection();
        self.set_state(SessionState::Disconnected);
        if was_connected {
            self.editor.notify(SyncEvent::ConnectionChanged(false));
        }

        if let Some(ticket) = self.persistence.begin_save() {
            self.start_save(ticket);
        }
        self.schedule_reconnect(Instant::now());
    }

    /// Unsubscribe, say goodbye if still possible, close. Never fails.
    fn release_connection(&mut self) {
        self.keepalive_at = None;
        let router = self.router.take();
        if let Some(router) = &router {
            for (kind, id) in self.subscriptions.drain(..) {
                if let Err(e) = router.unsubscribe(id) {
                    log::debug!("[{}] Unsubscribe {kind:?} failed: {e}", self.tag);
                }
            }
            if router.is_open() {
                let publication = self.broadcaster.left();
                if let Err(e) = router.publish(&publication.topic, publication.args) {
                    log::debug!("[{}] Could not announce departure: {e}", self.tag);
                }
            }
            router.close();
        }
        self.subscriptions.clear();
        self.transport_events = None;
        self.pending_subscribes = 0;
        self.fetch_settled = false;
        self.fetched = false;
        self.announced = false;
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        match self.config.reconnect.delay_for(self.reconnect_attempt) {
            Some(delay) => {
                log::info!("[{}] Reconnecting in {delay:?}", self.tag);
                self.reconnect_at = Some(now + delay);
                self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
            }
            None => log::error!(
                "[{}] Giving up after {} reconnect attempts",
                self.tag,
                self.reconnect_attempt
            ),
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Inbound messages
    // ───────────────────────────────────────────────────────────────────

    fn on_message(&mut self, topic: &str, args: &[Value]) {
        match TopicKind::classify(topic) {
            Some(TopicKind::DocumentChanged) => self.on_remote_change(args),
            Some(TopicKind::CursorMoved) => self.on_remote_cursor(args),
            Some(TopicKind::UserJoined) => self.on_user_joined(args),
            Some(TopicKind::UserLeft) => self.on_user_left(args),
            Some(TopicKind::Ping) => log::trace!("[{}] Ping received", self.tag),
            None => log::debug!("[{}] Message on unexpected topic {topic}", self.tag),
        }
    }

    fn on_remote_change(&mut self, args: &[Value]) {
        if !self.loaded {
            log::debug!("[{}] Remote change before load, dropped", self.tag);
            return;
        }
        let editor = &self.editor;
        let outcome = self.applier.apply(
            args,
            &mut self.buffer,
            &self.applying_remote,
            |change, buffer| {
                editor.notify(SyncEvent::RemoteChange {
                    change: change.clone(),
                    content: buffer.text(),
                });
            },
        );
        match outcome {
            ApplyOutcome::Applied(_) => {
                self.persistence.mark_dirty(Instant::now());
                self.update_save_status();
            }
            ApplyOutcome::Ignored(reason) => {
                log::debug!("[{}] Remote change ignored: {reason:?}", self.tag)
            }
            ApplyOutcome::Dropped(reason) => {
                log::warn!("[{}] Dropping malformed change: {reason}", self.tag)
            }
        }
    }

    fn on_remote_cursor(&mut self, args: &[Value]) {
        let update = match CursorUpdate::from_args(args) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("[{}] Dropping malformed cursor update: {e}", self.tag);
                return;
            }
        };
        if update.document_id != self.document_id || update.user_id == self.presence.local_user_id() {
            return;
        }
        log::trace!("[{}] {} moved cursor to {}", self.tag, update.username, update.position);
        if self
            .presence
            .cursor_moved(&update.user_id, &update.username, update.position)
        {
            self.editor
                .notify(SyncEvent::PresenceChanged(self.presence.snapshot()));
        }
        self.editor.notify(SyncEvent::CursorMoved(update));
    }

    fn on_user_joined(&mut self, args: &[Value]) {
        let (document_id, user) = match decode_presence(args) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("[{}] Dropping malformed join: {e}", self.tag);
                return;
            }
        };
        if document_id != self.document_id {
            return;
        }
        if let Some(peers) = self.presence.user_joined(&user) {
            log::info!("[{}] {} joined", self.tag, user.username);
            self.editor.notify(SyncEvent::PresenceChanged(peers));
            // Catch the newcomer up
            if self.can_publish() {
                let publication = self.broadcaster.full_text(self.buffer.text());
                self.publish(&publication);
            }
        }
    }

    fn on_user_left(&mut self, args: &[Value]) {
        let (document_id, user) = match decode_presence(args) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("[{}] Dropping malformed leave: {e}", self.tag);
                return;
            }
        };
        if document_id != self.document_id {
            return;
        }
        if let Some(peers) = self.presence.user_left(&user) {
            log::info!("[{}] {} left", self.tag, user.username);
            self.editor.notify(SyncEvent::PresenceChanged(peers));
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Local activity
    // ───────────────────────────────────────────────────────────────────

    fn on_local_edit(&mut self, spans: Vec<EditSpan>) {
        if !self.loaded {
            log::debug!("[{}] Local edit before load rejected", self.tag);
            return;
        }
        if spans.iter().all(EditSpan::is_noop) {
            return;
        }
        if let Err(e) = self.buffer.apply(&spans) {
            log::warn!("[{}] Local edit does not fit the document: {e}", self.tag);
            return;
        }
        self.persistence.mark_dirty(Instant::now());
        self.update_save_status();

        match self
            .broadcaster
            .local_edit(&spans, self.applying_remote.is_set(), self.can_publish())
        {
            Ok(publication) => self.publish(&publication),
            Err(reason) => log::debug!("[{}] Local edit not broadcast: {reason:?}", self.tag),
        }
    }

    fn on_local_cursor(&mut self, position: usize) {
        if self.can_publish() {
            let publication = self.broadcaster.cursor(position);
            self.publish(&publication);
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Timers and saving
    // ───────────────────────────────────────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        [self.persistence.next_deadline(), self.keepalive_at, self.reconnect_at]
            .into_iter()
            .flatten()
            .min()
    }

    fn on_tick(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.dispatch(SessionEvent::Connect);
        }
        if self.keepalive_at.is_some_and(|at| at <= now) {
            self.keepalive_at = self.keepalive_after(now);
            if self.router.as_ref().is_some_and(|r| r.is_open()) {
                let publication = self.broadcaster.ping(epoch_millis());
                self.publish(&publication);
            }
        }
        if self.persistence.poll(now) {
            if let Some(ticket) = self.persistence.begin_save() {
                self.start_save(ticket);
            }
        }
    }

    /// Next ping deadline; a zero interval disables pings.
    fn keepalive_after(&self, now: Instant) -> Option<Instant> {
        let interval = self.config.keepalive_interval;
        (!interval.is_zero()).then(|| now + interval)
    }

    fn start_save(&mut self, ticket: SaveTicket) {
        let storage = self.storage.clone();
        let document_id = self.document_id.clone();
        let content = self.buffer.text();
        let tx = self.internal_tx.clone();
        log::debug!("[{}] Saving {} chars", self.tag, content.chars().count());
        tokio::spawn(async move {
            let result = storage.update_content(&document_id, &content).await;
            let _ = tx.send(SessionEvent::SaveFinished { ticket, result });
        });
        self.update_save_status();
    }

    fn on_save_finished(&mut self, ticket: SaveTicket, result: Result<(), StorageError>) {
        let ok = result.is_ok();
        match result {
            Ok(()) => log::info!("[{}] Document saved", self.tag),
            Err(e) => log::warn!("[{}] Save failed: {e}", self.tag),
        }
        self.persistence.finish_save(ticket, ok, Instant::now());
        self.update_save_status();
    }

    fn update_save_status(&mut self) {
        let status = self.persistence.status();
        if status != self.save_status {
            self.save_status = status;
            self.editor.notify(SyncEvent::SaveStatus(status));
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Teardown
    // ───────────────────────────────────────────────────────────────────

    /// Cancel timers, leave, close, and flush pending content. Every step
    /// runs even if an earlier one fails.
    pub(crate) async fn teardown(&mut self, internal: &mut mpsc::UnboundedReceiver<SessionEvent>) {
        log::info!("[{}] Tearing down", self.tag);
        self.reconnect_at = None;
        self.persistence.cancel_timers();
        let was_connected = self.state == SessionState::Connected;
        self.release_connection();
        // Late replies from the closed connection are now stale
        self.generation += 1;

        // An older save landing after the final one would overwrite it
        if self.persistence.is_saving() {
            self.settle_save_in_flight(internal).await;
            self.persistence.cancel_timers();
        }

        if let Some(ticket) = self.persistence.begin_final_save() {
            let content = self.buffer.text();
            let result = self.storage.update_content(&self.document_id, &content).await;
            match &result {
                Ok(()) => log::info!("[{}] Final save complete", self.tag),
                Err(e) => log::error!("[{}] Final save failed: {e}", self.tag),
            }
            self.persistence.finish_save(ticket, result.is_ok(), Instant::now());
            self.persistence.cancel_timers();
            self.update_save_status();
        }

        self.set_state(SessionState::Closed);
        if was_connected {
            self.editor.notify(SyncEvent::ConnectionChanged(false));
        }
    }

    async fn settle_save_in_flight(&mut self, internal: &mut mpsc::UnboundedReceiver<SessionEvent>) {
        let limit = self.config.request_timeout;
        let wait = async {
            while self.persistence.is_saving() {
                match internal.recv().await {
                    Some(SessionEvent::SaveFinished { ticket, result }) => {
                        self.on_save_finished(ticket, result)
                    }
                    // Closes connections that opened too late
                    Some(event @ SessionEvent::Opened { .. }) => self.dispatch(event),
                    Some(_) => {}
                    None => break,
                }
            }
        };
        let settled = tokio::time::timeout(limit, wait).await.is_ok();
        if !settled {
            log::warn!("[{}] Save in flight did not finish within {limit:?}", self.tag);
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Helpers
    // ───────────────────────────────────────────────────────────────────

    fn can_publish(&self) -> bool {
        self.state == SessionState::Connected
            && self.fetched
            && self.router.as_ref().is_some_and(|r| r.is_open())
    }

    fn publish(&self, publication: &Publication) {
        let Some(router) = &self.router else {
            return;
        };
        if let Err(e) = router.publish(&publication.topic, publication.args.clone()) {
            log::debug!("[{}] Publish to {} failed: {e}", self.tag, publication.topic);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            loaded: self.loaded,
            content: self.buffer.text(),
            peers: self.presence.snapshot(),
            save_status: self.persistence.status(),
            has_pending_changes: self.persistence.has_pending(),
            last_saved_at: self.persistence.last_saved_at(),
            subscriptions: self.subscriptions.len(),
        }
    }
}

async fn next_transport_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> TransportEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or_else(|| TransportEvent::Closed {
            reason: "wamp.close.transport_lost".to_string(),
            details: String::new(),
        }),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
