//! Session lifecycle tests against the in-memory router and store.
//!
//! Time is paused, so debounce, retry, sweep and reconnect delays run on
//! virtual time.

use std::sync::Arc;

use coedit_sync::auth::UserIdentity;
use coedit_sync::config::SyncConfig;
use coedit_sync::persistence::SaveStatus;
use coedit_sync::protocol::{change_args, ChangeEvent, EditSpan, TopicKind};
use coedit_sync::session::{SessionError, SessionState, SyncEvent, SyncHandle, SyncSession};
use coedit_sync::storage::memory::MemoryStorage;
use coedit_sync::storage::StorageError;
use coedit_sync::transport::memory::MemoryRouter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

const DOC: &str = "doc1";

fn start(
    router: &MemoryRouter,
    store: &MemoryStorage,
    user: (&str, &str),
) -> (SyncHandle, mpsc::UnboundedReceiver<SyncEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SyncSession::spawn(
        SyncConfig::default(),
        DOC,
        &UserIdentity::new(user.0, user.1),
        Arc::new(router.connector()),
        Arc::new(store.clone()),
        tx,
    );
    (handle, rx)
}

/// Wait until the document is loaded and all topics are subscribed.
async fn wait_ready(handle: &SyncHandle) {
    for _ in 0..100 {
        let snapshot = handle.snapshot().await.unwrap();
        if snapshot.loaded && snapshot.subscriptions == 4 {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("session never became ready");
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_connects_loads_and_announces() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "hello");
    let (handle, mut rx) = start(&router, &store, ("B", "bob"));

    assert!(handle.wait_for_state(SessionState::Connected).await);
    wait_ready(&handle).await;

    let events = drain(&mut rx);
    assert!(matches!(events[0], SyncEvent::ConnectionChanged(true)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::DocumentLoaded(d) if d.content == "hello")));

    let joined = router.published_on("code.user.joined");
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].args[0], "doc1");
    assert_eq!(joined[0].args[1]["id"], "B");
}

#[tokio::test(start_paused = true)]
async fn test_rapid_edits_coalesce_into_one_save() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "hello");
    let (handle, _rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;

    for at in 5..8 {
        handle.local_edit(vec![EditSpan::insert(at, "!")]).unwrap();
        sleep(Duration::from_millis(300)).await;
    }
    // 700 ms after the last edit: still inside the debounce window
    sleep(Duration::from_millis(400)).await;
    assert_eq!(store.save_calls(), 0);

    sleep(Duration::from_millis(400)).await;
    assert_eq!(store.saved_contents(), ["hello!!!"]);
    assert_eq!(store.content(DOC).as_deref(), Some("hello!!!"));

    let snapshot = handle.snapshot().await.unwrap();
    assert!(!snapshot.has_pending_changes);
    assert_eq!(snapshot.save_status, SaveStatus::Saved);
    assert!(snapshot.last_saved_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_spaced_edits_save_separately() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "");
    let (handle, _rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;

    handle.local_edit(vec![EditSpan::insert(0, "a")]).unwrap();
    sleep(Duration::from_millis(1500)).await;
    handle.local_edit(vec![EditSpan::insert(1, "b")]).unwrap();
    sleep(Duration::from_millis(1500)).await;

    assert_eq!(store.saved_contents(), ["a", "ab"]);
}

#[tokio::test(start_paused = true)]
async fn test_empty_edits_leave_document_clean() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "hello");
    let (handle, mut rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;
    drain(&mut rx);

    handle.local_edit(vec![]).unwrap();
    handle.local_edit(vec![EditSpan::insert(2, ""), EditSpan::delete(4, 4)]).unwrap();
    sleep(Duration::from_secs(15)).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert!(!snapshot.has_pending_changes);
    assert_eq!(snapshot.save_status, SaveStatus::Saved);
    assert_eq!(store.save_calls(), 0);
    assert!(router.published_on(&TopicKind::DocumentChanged.topic(DOC)).is_empty());
    assert!(!drain(&mut rx).iter().any(|e| matches!(e, SyncEvent::SaveStatus(_))));
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_retried_once_after_five_seconds() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "");
    let (handle, mut rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;
    drain(&mut rx);

    store.fail_next_saves(1);
    handle.local_edit(vec![EditSpan::insert(0, "a")]).unwrap();
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(store.save_calls(), 1);
    assert_eq!(handle.snapshot().await.unwrap().save_status, SaveStatus::Unsaved);

    sleep(Duration::from_millis(4000)).await;
    assert_eq!(store.save_calls(), 1);

    sleep(Duration::from_millis(1100)).await;
    assert_eq!(store.save_calls(), 2);
    assert_eq!(store.content(DOC).as_deref(), Some("a"));

    // Nothing pending: sweeps find nothing to do
    sleep(Duration::from_secs(30)).await;
    assert_eq!(store.save_calls(), 2);

    let statuses: Vec<SaveStatus> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::SaveStatus(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        [
            SaveStatus::Unsaved,
            SaveStatus::Saving,
            SaveStatus::Unsaved,
            SaveStatus::Saving,
            SaveStatus::Saved
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_change_applied_and_echo_dropped() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "hello");

    // An editor that echoes every remote change back as a local edit.
    let slot: Arc<Mutex<Option<SyncHandle>>> = Arc::new(Mutex::new(None));
    let echoes: Arc<Mutex<Vec<Result<(), SessionError>>>> = Arc::new(Mutex::new(Vec::new()));
    let editor = {
        let slot = slot.clone();
        let echoes = echoes.clone();
        move |event: SyncEvent| {
            if let SyncEvent::RemoteChange { .. } = event {
                if let Some(handle) = slot.lock().as_ref() {
                    echoes.lock().push(handle.local_edit(vec![EditSpan::insert(0, "x")]));
                }
            }
        }
    };
    let handle = SyncSession::spawn(
        SyncConfig::default(),
        DOC,
        &UserIdentity::new("B", "bob"),
        Arc::new(router.connector()),
        Arc::new(store.clone()),
        editor,
    );
    *slot.lock() = Some(handle.clone());
    wait_ready(&handle).await;

    let topic = TopicKind::DocumentChanged.topic(DOC);
    let change = ChangeEvent::RangeEdits {
        edits: vec![EditSpan::insert(0, "x")],
    };
    router.publish(&topic, change_args(DOC, &change, "A"));
    sleep(Duration::from_millis(10)).await;

    assert_eq!(handle.snapshot().await.unwrap().content, "xhello");
    assert_eq!(*echoes.lock(), [Err(SessionError::ApplyingRemote)]);
    // Only the external publication; nothing was re-broadcast
    assert_eq!(router.published_on(&topic).len(), 1);
    assert!(!handle.is_applying_remote());
}

#[tokio::test(start_paused = true)]
async fn test_own_and_foreign_document_changes_ignored() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "hello");
    let (handle, _rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;

    let change = ChangeEvent::FullText { text: "nope".into() };
    let topic = TopicKind::DocumentChanged.topic(DOC);
    router.publish(&topic, change_args(DOC, &change, "B"));
    router.publish(&topic, change_args("doc2", &change, "A"));
    sleep(Duration::from_millis(10)).await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.content, "hello");
    assert!(!snapshot.has_pending_changes);
}

#[tokio::test(start_paused = true)]
async fn test_edit_propagates_between_sessions() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "hello");
    let (alice, _alice_rx) = start(&router, &store, ("A", "alice"));
    let (bob, mut bob_rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&alice).await;
    wait_ready(&bob).await;
    sleep(Duration::from_millis(10)).await;
    drain(&mut bob_rx);
    router.clear_published();

    alice.local_edit(vec![EditSpan::insert(0, "x")]).unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(bob.snapshot().await.unwrap().content, "xhello");
    let topic = TopicKind::DocumentChanged.topic(DOC);
    let published = router.published_on(&topic);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].args[2], "A");
    assert_eq!(published[0].args[1]["type"], "range_edits");

    let remote: Vec<String> = drain(&mut bob_rx)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::RemoteChange { content, .. } => Some(content),
            _ => None,
        })
        .collect();
    assert_eq!(remote, ["xhello"]);
}

#[tokio::test(start_paused = true)]
async fn test_cursor_broadcast() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "hello");
    let (handle, _rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;

    handle.cursor_moved(3).unwrap();
    sleep(Duration::from_millis(10)).await;

    let moved = router.published_on(&TopicKind::CursorMoved.topic(DOC));
    assert_eq!(moved.len(), 1);
    let expected: Vec<serde_json::Value> = vec!["doc1".into(), 3.into(), "B".into(), "bob".into()];
    assert_eq!(moved[0].args, expected);
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_ping_every_thirty_seconds() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "");
    let (handle, _rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;

    sleep(Duration::from_secs(29)).await;
    assert!(router.published_on("code.ping").is_empty());
    sleep(Duration::from_secs(2)).await;
    let pings = router.published_on("code.ping");
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].args[1]["userId"], "B");
    sleep(Duration::from_secs(30)).await;
    assert_eq!(router.published_on("code.ping").len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zero_periods_disable_keepalive_and_sweep() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "");
    let config = SyncConfig {
        keepalive_interval: Duration::ZERO,
        sweep_interval: Duration::ZERO,
        ..SyncConfig::default()
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let handle = SyncSession::spawn(
        config,
        DOC,
        &UserIdentity::new("B", "bob"),
        Arc::new(router.connector()),
        Arc::new(store.clone()),
        tx,
    );
    wait_ready(&handle).await;

    sleep(Duration::from_millis(200)).await;
    assert!(router.published_on("code.ping").is_empty());
    assert_eq!(store.save_calls(), 0);
    handle.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_load_failure_reported_and_edits_rejected() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new();
    let (handle, mut rx) = start(&router, &store, ("B", "bob"));
    assert!(handle.wait_for_state(SessionState::Connected).await);
    sleep(Duration::from_millis(50)).await;

    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, SyncEvent::LoadFailed(StorageError::NotFound))));

    handle.local_edit(vec![EditSpan::insert(0, "x")]).unwrap();
    sleep(Duration::from_millis(10)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert!(!snapshot.loaded);
    assert_eq!(snapshot.content, "");
    assert!(!snapshot.has_pending_changes);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_flushes_and_leaves() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "hello");
    let (handle, _rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;

    handle.local_edit(vec![EditSpan::insert(5, " world")]).unwrap();
    handle.teardown().await;

    assert_eq!(store.saved_contents(), ["hello world"]);
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(router.subscription_count(), 0);
    assert_eq!(router.session_count(), 0);
    let left = router.published_on("code.user.left");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].args[1]["username"], "bob");

    assert_eq!(handle.local_edit(vec![]), Err(SessionError::Closed));
    assert!(handle.snapshot().await.is_err());

    assert!(handle.wait_for_state(SessionState::Closed).await);
    // The session is gone and will never connect again
    assert!(!handle.wait_for_state(SessionState::Connected).await);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_runs_every_step_when_save_fails() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "");
    let (handle, _rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;

    store.fail_next_saves(1);
    handle.local_edit(vec![EditSpan::insert(0, "a")]).unwrap();
    handle.teardown().await;

    assert_eq!(store.save_calls(), 1);
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(router.published_on("code.user.left").len(), 1);
    assert_eq!(router.session_count(), 0);

    // No timers survive teardown
    sleep(Duration::from_secs(60)).await;
    assert_eq!(store.save_calls(), 1);
    assert_eq!(router.open_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_waits_for_save_in_flight() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "");
    let (handle, _rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;

    store.delay_next_save(Duration::from_millis(500));
    handle.local_edit(vec![EditSpan::insert(0, "a")]).unwrap();
    // Debounce fired; the slow save of "a" is still running
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(handle.snapshot().await.unwrap().save_status, SaveStatus::Saving);

    handle.local_edit(vec![EditSpan::insert(1, "b")]).unwrap();
    handle.teardown().await;
    assert_eq!(store.content(DOC).as_deref(), Some("ab"));

    sleep(Duration::from_secs(2)).await;
    assert_eq!(store.saved_contents(), ["a", "ab"]);
    assert_eq!(store.content(DOC).as_deref(), Some("ab"));
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_with_fixed_delay_and_no_leaked_subscriptions() {
    let router = MemoryRouter::new();
    router.set_close_on_open(true);
    let store = MemoryStorage::new().with_document(DOC, "");
    let (handle, _rx) = start(&router, &store, ("B", "bob"));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(router.open_attempts(), 1);
    assert_eq!(router.subscription_count(), 0);
    assert_eq!(handle.state(), SessionState::Disconnected);

    for expected in 2..5 {
        sleep(Duration::from_millis(5000)).await;
        assert_eq!(router.open_attempts(), expected);
        assert_eq!(router.subscription_count(), 0);
        assert_eq!(handle.snapshot().await.unwrap().subscriptions, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_refused_open_retried() {
    let router = MemoryRouter::new();
    router.refuse_next_opens(1);
    let store = MemoryStorage::new().with_document(DOC, "hi");
    let (handle, _rx) = start(&router, &store, ("B", "bob"));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), SessionState::Disconnected);

    sleep(Duration::from_millis(5000)).await;
    wait_ready(&handle).await;
    assert_eq!(router.open_attempts(), 2);
    assert_eq!(handle.state(), SessionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_saves_and_resubscribes() {
    let router = MemoryRouter::new();
    let store = MemoryStorage::new().with_document(DOC, "hello");
    let (handle, mut rx) = start(&router, &store, ("B", "bob"));
    wait_ready(&handle).await;

    handle.local_edit(vec![EditSpan::insert(0, ">")]).unwrap();
    sleep(Duration::from_millis(10)).await;
    router.drop_all("wamp.close.system_shutdown");
    sleep(Duration::from_millis(10)).await;

    // Dirty content flushed on close, no subscriptions left behind
    assert_eq!(store.saved_contents(), [">hello"]);
    assert_eq!(handle.state(), SessionState::Disconnected);
    assert_eq!(router.subscription_count(), 0);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, SyncEvent::ConnectionChanged(false))));

    sleep(Duration::from_millis(5000)).await;
    wait_ready(&handle).await;
    assert_eq!(router.subscription_count(), 4);
    assert_eq!(handle.snapshot().await.unwrap().content, ">hello");
    assert_eq!(router.published_on("code.user.joined").len(), 2);
}
