// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::harness::{connect, request};
use ksi_daemon::lifecycle::{startup, Config};
use ksi_engine::handler_fn;
use serde_json::json;

/// A queued and an in-flight completion survive a daemon restart: the
/// queued one is re-emitted as `completion:async`, the in-flight one
/// produces `completion:failed {reason: "daemon_restart"}`.
#[tokio::test]
async fn checkpoint_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    // First daemon life: a completion service with one queued and one
    // processing request participates in the checkpoint.
    {
        let daemon = startup(Config::at(dir.path())).await.unwrap();
        daemon.router.register_handler(
            "completion",
            "checkpoint:collect",
            ksi_engine::handler::priority::NORMAL,
            handler_fn(|_, _| async move {
                Ok(Some(json!({
                    "session_queues": {
                        "sess_1": {
                            "items": [{"request_id": "req_q", "data": {"prompt": "queued"}}],
                            "is_active": true,
                            "active_request": "req_p"
                        }
                    },
                    "active_completions": {
                        "req_p": {
                            "session_id": "sess_1",
                            "status": "processing",
                            "data": {"prompt": "in flight"}
                        }
                    }
                })))
            }),
        );

        let mut stream = connect(&daemon).await;
        let resp = request(
            &mut stream,
            json!({"event": "dev:checkpoint", "data": {"action": "create"}}),
        )
        .await;
        assert_eq!(resp["data"]["checkpoint"], json!("created"));

        daemon.shutdown().await;
    }

    // Second daemon life: restore runs during startup (system:ready);
    // the restored emissions are visible in the reference event log.
    {
        let daemon = startup(Config::at(dir.path())).await.unwrap();
        daemon.router.event_log().unwrap().flush().await.unwrap();

        let mut stream = connect(&daemon).await;

        let reemitted = request(
            &mut stream,
            json!({
                "event": "monitor:get_events",
                "data": {"event_patterns": ["completion:async"], "limit": 10}
            }),
        )
        .await;
        assert_eq!(reemitted["data"]["data"]["count"], json!(1));
        assert_eq!(
            reemitted["data"]["data"]["events"][0]["data"],
            json!({"prompt": "queued"})
        );

        let failed = request(
            &mut stream,
            json!({
                "event": "monitor:get_events",
                "data": {"event_patterns": ["completion:failed"], "limit": 10}
            }),
        )
        .await;
        assert_eq!(failed["data"]["data"]["count"], json!(1));
        let failure = &failed["data"]["data"]["events"][0]["data"];
        assert_eq!(failure["request_id"], json!("req_p"));
        assert_eq!(failure["reason"], json!("daemon_restart"));

        daemon.shutdown().await;
    }
}

#[tokio::test]
async fn checkpoint_status_lists_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = startup(Config::at(dir.path())).await.unwrap();
    let mut stream = connect(&daemon).await;

    request(
        &mut stream,
        json!({"event": "dev:checkpoint", "data": {"action": "create"}}),
    )
    .await;
    request(
        &mut stream,
        json!({"event": "dev:checkpoint", "data": {"action": "create"}}),
    )
    .await;

    let resp = request(
        &mut stream,
        json!({"event": "dev:checkpoint", "data": {"action": "status"}}),
    )
    .await;
    let checkpoints = resp["data"]["data"]["checkpoints"].as_array().unwrap();
    assert!(checkpoints.len() >= 2);
    assert!(checkpoints.iter().all(|c| c["status"] == json!("active")));

    daemon.shutdown().await;
}
