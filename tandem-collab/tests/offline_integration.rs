//! Offline editing: durability across restarts, replay on reconnect,
//! overflow, and partial replay failures.

use tandem_collab::document::ReplicatedDocument;
use tandem_collab::offline::{FileStorage, MemoryStorage, Operation, OFFLINE_QUEUE_KEY};
use tandem_collab::orchestrator::{SessionConfig, SyncOrchestrator};
use tandem_collab::presence::{PresenceConfig, UserInfo};
use tandem_collab::reconnect::ReconnectConfig;
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::QueueStorage;
use tandem_core::{Group, Shape, ShapePatch};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::Duration;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> (SyncServer, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        ..ServerConfig::default()
    });
    let runner = server.clone();
    tokio::spawn(async move {
        runner.serve(listener).await.unwrap();
    });
    (server, format!("ws://{addr}"))
}

fn config(endpoint: &str, user_id: &str) -> SessionConfig {
    let mut config = SessionConfig::new(endpoint, "board", UserInfo::new(user_id, user_id));
    config.heartbeat_interval = None;
    config.reconnect = ReconnectConfig {
        base_delay: Duration::from_millis(20),
        min_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        attempt_timeout: Duration::from_secs(2),
        ..ReconnectConfig::default()
    };
    config
}

/// The edits made offline, in order.
fn offline_edits(session: &mut SyncOrchestrator) {
    session.add_shape(Shape::rectangle("s1", 0.0, 0.0, 100.0, 50.0)).unwrap();
    session.add_shape(Shape::circle("s2", 200.0, 0.0, 40.0, 40.0)).unwrap();
    session.update_shape("s1", ShapePatch::fill("#ff0000")).unwrap();
    session.add_group(Group::new("g1", ["s1", "s2"])).unwrap();
    session.update_shape("s2", ShapePatch::position(210.0, 10.0)).unwrap();
    session.delete_shape("s2").unwrap();
}

fn reference_document() -> ReplicatedDocument {
    let mut doc = ReplicatedDocument::new(Uuid::new_v4(), &UserInfo::new("ref", "ref"), PresenceConfig::default());
    doc.add_shape(Shape::rectangle("s1", 0.0, 0.0, 100.0, 50.0)).unwrap();
    doc.add_shape(Shape::circle("s2", 200.0, 0.0, 40.0, 40.0)).unwrap();
    doc.update_shape("s1", ShapePatch::fill("#ff0000")).unwrap();
    doc.add_group(Group::new("g1", ["s1", "s2"])).unwrap();
    doc.update_shape("s2", ShapePatch::position(210.0, 10.0)).unwrap();
    doc.delete_shape("s2").unwrap();
    doc
}

#[tokio::test]
async fn test_queue_survives_restart_and_replays() {
    let (_server, url) = start_relay().await;
    let dir = TempDir::new().unwrap();

    {
        let storage = FileStorage::open(dir.path()).unwrap();
        let mut session = SyncOrchestrator::new(config(&url, "u1"), storage);
        offline_edits(&mut session);
        assert_eq!(session.pending_changes().len(), 6);
        assert!(session.shapes().is_empty());
    }

    // The queue is a plain JSON array under the fixed key.
    let raw = std::fs::read_to_string(dir.path().join(format!("{OFFLINE_QUEUE_KEY}.json"))).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let entries = parsed.as_array().unwrap();
    assert_eq!(entries.len(), 6);
    assert_eq!(entries[0]["type"], "shape");
    assert_eq!(entries[0]["operation"], "add");
    assert_eq!(entries[0]["userId"], "u1");
    assert_eq!(entries[5]["data"]["id"], "s2");

    // A fresh process picks the queue up and replays it on connect.
    let storage = FileStorage::open(dir.path()).unwrap();
    let mut session = SyncOrchestrator::new(config(&url, "u1"), storage.clone());
    let ops: Vec<Operation> = session.pending_changes().iter().map(|c| c.operation).collect();
    assert_eq!(
        ops,
        vec![
            Operation::Add,
            Operation::Add,
            Operation::Update,
            Operation::Add,
            Operation::Update,
            Operation::Delete
        ]
    );

    session.connect().await.unwrap();
    assert!(session.run_until(WAIT, |s| s.pending_changes().is_empty()).await);

    let reference = reference_document();
    assert_eq!(session.shapes(), reference.shapes());
    assert_eq!(session.groups(), reference.groups());
    assert!(!session.can_undo());
    assert_eq!(storage.load(OFFLINE_QUEUE_KEY).unwrap().as_deref(), Some("[]"));

    // Another client sees the replayed result.
    let mut observer = SyncOrchestrator::new(config(&url, "u2"), MemoryStorage::new());
    observer.connect().await.unwrap();
    assert!(observer.run_until(WAIT, |s| s.shapes() == reference.shapes()).await);
    assert_eq!(observer.groups(), reference.groups());
}

#[tokio::test]
async fn test_overflow_keeps_newest_thousand() {
    let mut session = SyncOrchestrator::new(config("ws://127.0.0.1:9", "u1"), MemoryStorage::new());
    for i in 0..1100 {
        session.delete_shape(&format!("s{i}")).unwrap();
    }

    let pending = session.pending_changes();
    assert_eq!(pending.len(), 1000);
    assert_eq!(pending[0].data["id"], "s100");
    assert_eq!(pending[999].data["id"], "s1099");
}

#[tokio::test]
async fn test_failed_replay_stays_queued() {
    let (_server, url) = start_relay().await;
    let mut session = SyncOrchestrator::new(config(&url, "u1"), MemoryStorage::new());

    session.add_shape(Shape::rectangle("s1", 0.0, 0.0, 10.0, 10.0)).unwrap();
    session.update_shape("ghost", ShapePatch::fill("#00ff00")).unwrap();
    session.add_shape(Shape::rectangle("s2", 0.0, 0.0, 10.0, 10.0)).unwrap();

    session.connect().await.unwrap();
    assert!(session.run_until(WAIT, |s| s.shapes().len() == 2).await);

    let pending = session.pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Update);
    assert_eq!(pending[0].data["id"], "ghost");

    // Retrying replays what it can and still reports the failure.
    assert!(!session.sync_pending_changes());
    assert_eq!(session.pending_changes().len(), 1);
}

#[tokio::test]
async fn test_offline_mode_while_connected() {
    let (_server, url) = start_relay().await;
    let mut editor = SyncOrchestrator::new(config(&url, "u1"), MemoryStorage::new());
    let mut watcher = SyncOrchestrator::new(config(&url, "u2"), MemoryStorage::new());
    editor.connect().await.unwrap();
    watcher.connect().await.unwrap();

    editor.set_offline_mode(true);
    assert!(!editor.is_online());
    assert!(editor.connection_state().is_connected());

    editor.add_shape(Shape::rectangle("s1", 0.0, 0.0, 10.0, 10.0)).unwrap();
    assert!(editor.shapes().is_empty());
    assert_eq!(editor.pending_changes().len(), 1);
    assert!(!editor.sync_pending_changes());
    assert!(!watcher.run_until(Duration::from_millis(200), |s| !s.shapes().is_empty()).await);

    editor.set_offline_mode(false);
    assert!(editor.is_online());
    assert!(editor.pending_changes().is_empty());
    assert_eq!(editor.shapes().len(), 1);
    assert!(watcher.run_until(WAIT, |s| s.shapes().len() == 1).await);
}

#[tokio::test]
async fn test_queued_edits_to_relay_shapes_apply_after_restart() {
    let (server, url) = start_relay().await;
    let mut keeper = SyncOrchestrator::new(config(&url, "u2"), MemoryStorage::new());
    keeper.connect().await.unwrap();
    keeper.add_shape(Shape::rectangle("s1", 0.0, 0.0, 10.0, 10.0)).unwrap();
    keeper.add_shape(Shape::rectangle("s2", 20.0, 0.0, 10.0, 10.0)).unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while server.status().await.shapes.get("board") != Some(&2) {
        assert!(tokio::time::Instant::now() < deadline, "relay never saw both shapes");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Queued by a process that never saw the relay's shapes, then closed.
    let storage = MemoryStorage::new();
    {
        let mut session = SyncOrchestrator::new(config(&url, "u1"), storage.clone());
        session.delete_shape("s1").unwrap();
        session.update_shape("s2", ShapePatch::fill("#00ff00")).unwrap();
    }

    let mut session = SyncOrchestrator::new(config(&url, "u1"), storage);
    assert_eq!(session.pending_changes().len(), 2);
    session.connect().await.unwrap();

    assert!(session.pending_changes().is_empty());
    let ids: Vec<&str> = session.shapes().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["s2"]);
    assert_eq!(session.shapes()[0].style.fill, "#00ff00");

    assert!(
        keeper
            .run_until(WAIT, |s| s.shapes().len() == 1 && s.shapes()[0].style.fill == "#00ff00")
            .await
    );
    assert_eq!(keeper.shapes()[0].id, "s2");
}
