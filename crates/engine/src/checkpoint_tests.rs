// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::handler::handler_fn;
use crate::router::{EmitOptions, RouterConfig};
use crate::state::StateStore;
use ksi_core::{FakeClock, SequentialIdGen};
use parking_lot::Mutex;

struct Fixture {
    router: EventRouter,
    engine: Arc<CheckpointEngine>,
}

async fn fixture_at(path: &std::path::Path) -> Fixture {
    let clock: Arc<FakeClock> = Arc::new(FakeClock::new());
    let router = EventRouter::new(RouterConfig {
        idgen: Arc::new(SequentialIdGen::new("t")),
        clock: clock.clone(),
        cold_contexts: None,
        event_log: None,
    });
    StateStore::new(clock).register(&router);

    let db = CheckpointDb::open(&path.join("checkpoint.db"), false)
        .await
        .unwrap();
    let engine = CheckpointEngine::new(db, false);
    engine.register(&router);

    Fixture { router, engine }
}

async fn fixture() -> (tempfile::TempDir, Fixture) {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture_at(dir.path()).await;
    (dir, f)
}

/// Simulated completion service contributing queue state to checkpoints.
fn install_completion_partial(router: &EventRouter) {
    router.register_handler(
        "completion",
        "checkpoint:collect",
        priority::NORMAL,
        handler_fn(|_, _| async move {
            Ok(Some(json!({
                "session_queues": {
                    "sess_1": {
                        "items": [
                            {"request_id": "req_queued", "data": {"prompt": "later"}, "timestamp": "t1"}
                        ],
                        "is_active": true,
                        "active_request": "req_active"
                    }
                },
                "active_completions": {
                    "req_active": {
                        "session_id": "sess_1",
                        "status": "processing",
                        "data": {"prompt": "now"},
                        "started_at": "t0"
                    },
                    "req_done": {
                        "session_id": "sess_1",
                        "status": "completed",
                        "data": {}
                    }
                }
            })))
        }),
    );
}

fn capture(router: &EventRouter, event: &str) -> Arc<Mutex<Vec<Value>>> {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    router.register_handler(
        "test",
        event,
        priority::NORMAL,
        handler_fn(move |data, _| {
            let sink = sink.clone();
            async move {
                sink.lock().push(data);
                Ok(None)
            }
        }),
    );
    captured
}

async fn first(router: &EventRouter, event: &str, data: Value) -> Value {
    router
        .emit_first(event, data, EmitOptions::default())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn create_collects_and_persists() {
    let (_dir, f) = fixture().await;
    install_completion_partial(&f.router);

    let resp = first(&f.router, "dev:checkpoint", json!({"action": "create"})).await;
    assert_eq!(resp["checkpoint"], json!("created"));
    assert_eq!(resp["total_requests"], json!(3));
    assert_eq!(resp["total_sessions"], json!(1));

    let status = first(&f.router, "dev:checkpoint", json!({"action": "status"})).await;
    let checkpoints = status["data"]["checkpoints"].as_array().unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0]["status"], json!("active"));
    assert_eq!(checkpoints[0]["reason"], json!("manual"));
}

#[tokio::test]
async fn empty_state_skipped_unless_forced() {
    let (_dir, f) = fixture().await;

    // No participants: shutdown checkpoints skip empty state.
    let ctx_resp = f.router.emit("system:shutdown", json!({})).await.unwrap();
    assert!(ctx_resp.iter().any(|r| r["checkpoint"] == json!("empty")));

    // dev:checkpoint create forces a save.
    let resp = first(&f.router, "dev:checkpoint", json!({"action": "create"})).await;
    assert_eq!(resp["checkpoint"], json!("created"));
}

#[tokio::test]
async fn restore_reemits_queued_and_fails_inflight() {
    // First process life: collect and store.
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().to_path_buf();
    {
        let f = fixture_at(dir.path()).await;
        install_completion_partial(&f.router);
        let resp = first(&f.router, "dev:checkpoint", json!({"action": "create"})).await;
        assert_eq!(resp["checkpoint"], json!("created"));
    }

    // Second process life: a fresh router restoring from the same DB.
    let clock: Arc<FakeClock> = Arc::new(FakeClock::new());
    let router = EventRouter::new(RouterConfig {
        idgen: Arc::new(SequentialIdGen::new("r")),
        clock: clock.clone(),
        cold_contexts: None,
        event_log: None,
    });
    StateStore::new(clock).register(&router);
    let db = CheckpointDb::open(&db_path.join("checkpoint.db"), false)
        .await
        .unwrap();
    let engine = CheckpointEngine::new(db, false);
    engine.register(&router);

    let reemitted = capture(&router, "completion:async");
    let failed = capture(&router, "completion:failed");

    let results = router.emit("system:ready", json!({})).await.unwrap();
    let restore = results
        .iter()
        .find(|r| r.get("checkpoint").is_some())
        .unwrap();
    assert_eq!(restore["checkpoint"], json!("restored"));
    assert_eq!(restore["restored_requests"], json!(1));
    assert_eq!(restore["lost_processing"], json!(1));

    assert_eq!(reemitted.lock().clone(), vec![json!({"prompt": "later"})]);
    let failures = failed.lock().clone();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["request_id"], json!("req_active"));
    assert_eq!(failures[0]["reason"], json!("daemon_restart"));
}

#[tokio::test]
async fn restore_rehydrates_context_and_entities() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().to_path_buf();
    let correlation;
    {
        let f = fixture_at(dir.path()).await;
        // Agent entity participates via the state store.
        first(
            &f.router,
            "state:entity:create",
            json!({"type": "agent", "id": "a1", "properties": {"status": "ready"}}),
        )
        .await;
        // Populate hot context storage with one chain.
        f.router.emit("work:step", json!({"n": 1})).await.unwrap();
        correlation = f
            .router
            .contexts()
            .find_by_name("work:step")
            .unwrap()
            .context
            .correlation_id;

        first(&f.router, "dev:checkpoint", json!({"action": "create"})).await;
    }

    let clock: Arc<FakeClock> = Arc::new(FakeClock::new());
    let router = EventRouter::new(RouterConfig {
        idgen: Arc::new(SequentialIdGen::new("r")),
        clock: clock.clone(),
        cold_contexts: None,
        event_log: None,
    });
    let state = StateStore::new(clock);
    state.register(&router);
    let db = CheckpointDb::open(&db_path.join("checkpoint.db"), false)
        .await
        .unwrap();
    CheckpointEngine::new(db, false).register(&router);

    router.emit("system:ready", json!({})).await.unwrap();

    // Hot context chain is back.
    assert!(!router
        .contexts()
        .by_correlation(correlation.as_str())
        .is_empty());
    // The agent entity is back.
    assert!(state.lookup("agent", "a1").is_some());
}

#[tokio::test]
async fn dev_actions_manage_requests() {
    let (_dir, f) = fixture().await;
    install_completion_partial(&f.router);
    first(&f.router, "dev:checkpoint", json!({"action": "create"})).await;

    let resp = first(&f.router, "dev:checkpoint", json!({"action": "list_requests"})).await;
    let requests = resp["data"]["requests"].as_object().unwrap();
    assert_eq!(requests.len(), 3);

    let resp = first(
        &f.router,
        "dev:checkpoint",
        json!({"action": "remove_request", "request_id": "req_done"}),
    )
    .await;
    assert_eq!(resp["data"]["removed"], json!(1));

    let resp = first(&f.router, "dev:checkpoint", json!({"action": "clear_all"})).await;
    assert_eq!(resp["data"]["status"], json!("cleared"));
    let resp = first(&f.router, "dev:checkpoint", json!({"action": "list_requests"})).await;
    assert_eq!(resp["checkpoint"], json!("no_checkpoint"));
}

#[tokio::test]
async fn unknown_action_is_rejected() {
    let (_dir, f) = fixture().await;
    let resp = first(&f.router, "dev:checkpoint", json!({"action": "detonate"})).await;
    assert_eq!(resp["error"], json!("Unknown action"));
}

#[tokio::test]
async fn disabled_engine_reports_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<FakeClock> = Arc::new(FakeClock::new());
    let router = EventRouter::new(RouterConfig {
        idgen: Arc::new(SequentialIdGen::new("t")),
        clock: clock.clone(),
        cold_contexts: None,
        event_log: None,
    });
    let db = CheckpointDb::open(&dir.path().join("checkpoint.db"), false)
        .await
        .unwrap();
    CheckpointEngine::new(db, true).register(&router);

    let resp = first(&router, "dev:checkpoint", json!({"action": "create"})).await;
    assert_eq!(resp["error"], json!("Checkpoint system disabled"));
}

#[tokio::test]
async fn shutdown_checkpoint_acknowledges() {
    let (_dir, f) = fixture().await;
    install_completion_partial(&f.router);
    f.router.begin_shutdown();
    f.router.emit("system:shutdown", json!({})).await.unwrap();
    assert!(
        f.router
            .wait_for_shutdown_acks(&["checkpoint".to_string()], std::time::Duration::from_secs(1))
            .await
    );
    let _ = &f.engine;
}
