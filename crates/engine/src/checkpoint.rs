// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Checkpoint engine.
//!
//! Collects state from participating services via `checkpoint:collect`,
//! merges the partials into one checkpoint row, and snapshots hot context
//! storage alongside. Restore runs after `system:ready`: context state
//! first, then queued completion requests are re-emitted and requests
//! that were in flight when the daemon stopped produce
//! `completion:failed {reason: "daemon_restart"}` so callers can retry.

use crate::handler::{handler_fn, priority, EventContext, HandlerResult};
use crate::response::{error_response, success_response};
use crate::router::EventRouter;
use ksi_storage::{
    CheckpointData, CheckpointDb, QueuedRequest, RequestSnapshot, SessionQueueSnapshot,
};
use ksi_transform::template::timestamp_utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Error substrings that mark a failed request as shutdown-caused and
/// worth retrying after restart.
const SHUTDOWN_ERROR_PATTERNS: &[&str] = &[
    "signal -9",
    "SIGKILL",
    "terminated with signal",
    "daemon restart",
    "shutdown",
    "Connection lost",
    "cancelled",
];

pub struct CheckpointEngine {
    db: CheckpointDb,
    disabled: bool,
}

impl CheckpointEngine {
    pub fn new(db: CheckpointDb, disabled: bool) -> Arc<Self> {
        Arc::new(Self { db, disabled })
    }

    pub fn register(self: &Arc<Self>, router: &EventRouter) {
        let module = "checkpoint";

        // Restore runs late, after every service has registered.
        let engine = Arc::clone(self);
        router.register_handler(
            module,
            "system:ready",
            priority::LOW,
            handler_fn(move |_data, ctx| {
                let engine = Arc::clone(&engine);
                async move {
                    if engine.disabled {
                        return Ok(Some(json!({"checkpoint": "disabled"})));
                    }
                    Ok(Some(engine.restore(&ctx).await))
                }
            }),
        );

        let engine = Arc::clone(self);
        router.register_handler(
            module,
            "system:shutdown",
            priority::LOW,
            handler_fn(move |_data, ctx| {
                let engine = Arc::clone(&engine);
                async move {
                    let result = if engine.disabled {
                        json!({"checkpoint": "disabled"})
                    } else {
                        engine.create(&ctx, "shutdown", false).await
                    };
                    let _ = ctx
                        .emit("shutdown:acknowledge", json!({"service": "checkpoint"}))
                        .await;
                    Ok(Some(result))
                }
            }),
        );

        let engine = Arc::clone(self);
        router.register_handler(
            module,
            "dev:checkpoint",
            priority::NORMAL,
            handler_fn(move |data, ctx| {
                let engine = Arc::clone(&engine);
                async move { engine.dev_checkpoint(data, ctx).await }
            }),
        );

        let engine = Arc::clone(self);
        router.register_handler(
            module,
            "dev:restore",
            priority::NORMAL,
            handler_fn(move |_data, ctx| {
                let engine = Arc::clone(&engine);
                async move {
                    if engine.disabled {
                        return Ok(Some(json!({"checkpoint": "disabled"})));
                    }
                    Ok(Some(engine.restore(&ctx).await))
                }
            }),
        );
    }

    /// Gather checkpoint partials from every participating service.
    pub async fn collect(&self, ctx: &EventContext) -> CheckpointData {
        let responses = ctx
            .emit("checkpoint:collect", json!({}))
            .await
            .unwrap_or_default();

        let mut data = CheckpointData {
            created_at: timestamp_utc(),
            reason: "manual".into(),
            ..Default::default()
        };

        for response in responses {
            merge_partial(&mut data, &response);
        }
        data
    }

    /// Create a checkpoint. Empty state is skipped unless forced.
    pub async fn create(&self, ctx: &EventContext, reason: &str, save_if_empty: bool) -> Value {
        if self.disabled {
            return json!({"error": "Checkpoint system disabled"});
        }

        let mut data = self.collect(ctx).await;
        data.reason = reason.to_string();
        let (total_requests, total_sessions) = data.totals();

        if !save_if_empty && total_requests == 0 && total_sessions == 0 {
            return json!({"checkpoint": "empty"});
        }

        let checkpoint_id = match self.db.save(&data).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "checkpoint save failed");
                return error_response("Checkpoint save failed", Some(json!({"reason": e.to_string()})));
            }
        };

        // Context sub-snapshot in its own transaction; failure does not
        // invalidate the primary checkpoint.
        if let Ok(contexts) = ctx.handle.contexts() {
            let snapshot = contexts.snapshot();
            let stats = contexts.stats();
            let snapshot_value = serde_json::to_value(&snapshot).unwrap_or(Value::Null);
            let correlations: Vec<String> = snapshot
                .events
                .iter()
                .map(|r| r.context.correlation_id.as_str().to_string())
                .collect();
            if let Err(e) = self
                .db
                .save_context_snapshot(
                    checkpoint_id,
                    &snapshot_value,
                    &json!(correlations),
                    &serde_json::to_value(&stats).unwrap_or(Value::Null),
                    &timestamp_utc(),
                )
                .await
            {
                warn!(checkpoint_id, error = %e, "context snapshot save failed");
            }
        }

        info!(
            checkpoint_id,
            reason, total_requests, total_sessions, "checkpoint created"
        );
        json!({
            "checkpoint": "created",
            "checkpoint_id": checkpoint_id,
            "reason": reason,
            "total_requests": total_requests,
            "total_sessions": total_sessions,
        })
    }

    /// Restore the latest active checkpoint.
    pub async fn restore(&self, ctx: &EventContext) -> Value {
        let checkpoint = match self.db.load_latest().await {
            Ok(Some(c)) => c,
            Ok(None) => return json!({"checkpoint": "no_checkpoint"}),
            Err(e) => {
                warn!(error = %e, "checkpoint load failed");
                return error_response("Checkpoint load failed", Some(json!({"reason": e.to_string()})));
            }
        };
        let checkpoint_id = checkpoint.checkpoint_id.unwrap_or_default();

        // 1. Context state first so restored emissions can link to it.
        let mut context_result = json!({"status": "skipped"});
        match self.db.load_context_snapshot(checkpoint_id).await {
            Ok(Some(snapshot_value)) => {
                if let Ok(contexts) = ctx.handle.contexts() {
                    match serde_json::from_value::<crate::context::HotSnapshot>(snapshot_value) {
                        Ok(snapshot) => {
                            let restored = contexts.restore(snapshot);
                            context_result = json!({"status": "restored", "events_restored": restored});
                        }
                        Err(e) => {
                            warn!(error = %e, "context snapshot did not parse");
                            context_result = json!({"status": "failed", "error": e.to_string()});
                        }
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "context snapshot load failed");
            }
        }

        // 2. Agent and identity entities.
        for (agent_id, properties) in &checkpoint.agents {
            let _ = ctx
                .emit(
                    "state:entity:create",
                    json!({"type": "agent", "id": agent_id, "properties": properties}),
                )
                .await;
        }
        for (agent_id, properties) in &checkpoint.identities {
            let _ = ctx
                .emit(
                    "state:entity:create",
                    json!({"type": "identity", "id": agent_id, "properties": properties}),
                )
                .await;
        }

        // 3. Re-emit queued requests.
        let mut restored_requests = 0usize;
        for session in checkpoint.sessions.values() {
            for item in &session.items {
                let _ = ctx.emit("completion:async", item.data.clone()).await;
                restored_requests += 1;
            }
        }

        // 4. In-flight requests are failed so callers can retry.
        let mut lost_processing = 0usize;
        for (request_id, request) in &checkpoint.requests {
            let should_retry = match request.status.as_str() {
                "processing" => true,
                "failed" => request.error.as_ref().is_some_and(|error| {
                    SHUTDOWN_ERROR_PATTERNS
                        .iter()
                        .any(|p| error.to_lowercase().contains(&p.to_lowercase()))
                }),
                _ => false,
            };
            if should_retry {
                lost_processing += 1;
                let _ = ctx
                    .emit(
                        "completion:failed",
                        json!({
                            "request_id": request_id,
                            "reason": "daemon_restart",
                            "message": "Request was in flight when the daemon stopped",
                            "original_error": &request.error,
                            "completion_data": request,
                        }),
                    )
                    .await;
            }
        }

        if let Err(e) = self.db.mark_restored(checkpoint_id, &timestamp_utc()).await {
            warn!(error = %e, "failed to mark checkpoint restored");
        }

        info!(
            checkpoint_id,
            restored_requests, lost_processing, "checkpoint restored"
        );
        json!({
            "checkpoint": "restored",
            "checkpoint_id": checkpoint_id,
            "restored_requests": restored_requests,
            "lost_processing": lost_processing,
            "context_results": context_result,
        })
    }

    async fn dev_checkpoint(self: Arc<Self>, data: Value, ctx: EventContext) -> HandlerResult {
        let action = data
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("status");

        if self.disabled && action != "status" {
            return Ok(Some(json!({"error": "Checkpoint system disabled"})));
        }

        let result = match action {
            "create" => self.create(&ctx, "manual", true).await,
            "status" => match self.db.list().await {
                Ok(list) => success_response(json!({
                    "checkpoints": list,
                    "disabled": self.disabled,
                })),
                Err(e) => error_response("Status query failed", Some(json!({"reason": e.to_string()}))),
            },
            "list_requests" => match self.db.load_latest().await {
                Ok(Some(checkpoint)) => success_response(json!({
                    "checkpoint_id": checkpoint.checkpoint_id,
                    "requests": checkpoint.requests,
                })),
                Ok(None) => json!({"checkpoint": "no_checkpoint"}),
                Err(e) => error_response("Load failed", Some(json!({"reason": e.to_string()}))),
            },
            "remove_request" => {
                let Some(request_id) = data.get("request_id").and_then(Value::as_str) else {
                    return Ok(Some(error_response("Missing request_id", None)));
                };
                match self.db.remove_request(request_id).await {
                    Ok(removed) => success_response(json!({"removed": removed})),
                    Err(e) => error_response("Remove failed", Some(json!({"reason": e.to_string()}))),
                }
            }
            "clear_failed" => match self.db.clear_failed().await {
                Ok(removed) => success_response(json!({"removed": removed})),
                Err(e) => error_response("Clear failed", Some(json!({"reason": e.to_string()}))),
            },
            "clear_all" => match self.db.clear_all().await {
                Ok(()) => success_response(json!({"status": "cleared"})),
                Err(e) => error_response("Clear failed", Some(json!({"reason": e.to_string()}))),
            },
            other => error_response(
                "Unknown action",
                Some(json!({
                    "action": other,
                    "supported": ["create", "status", "list_requests", "remove_request", "clear_failed", "clear_all"],
                })),
            ),
        };

        Ok(Some(result))
    }
}

/// Merge one service's `checkpoint:collect` response into the data set.
fn merge_partial(data: &mut CheckpointData, response: &Value) {
    if let Some(queues) = response.get("session_queues").and_then(Value::as_object) {
        for (session_id, queue) in queues {
            let snapshot = parse_session(queue);
            data.sessions.insert(session_id.clone(), snapshot);
        }
    }

    if let Some(completions) = response.get("active_completions").and_then(Value::as_object) {
        for (request_id, completion) in completions {
            data.requests
                .insert(request_id.clone(), parse_request(completion));
        }
    }

    if let Some(agents) = response.get("agents").and_then(Value::as_object) {
        for (id, props) in agents {
            data.agents.insert(id.clone(), props.clone());
        }
    }
    if let Some(identities) = response.get("identities").and_then(Value::as_object) {
        for (id, props) in identities {
            data.identities.insert(id.clone(), props.clone());
        }
    }
}

/// Sessions arrive either as a bare item list or as a full snapshot
/// object.
fn parse_session(value: &Value) -> SessionQueueSnapshot {
    match value {
        Value::Array(items) => SessionQueueSnapshot {
            items: items.iter().map(parse_queued).collect(),
            is_active: false,
            active_request: None,
        },
        Value::Object(map) => SessionQueueSnapshot {
            items: map
                .get("items")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(parse_queued).collect())
                .unwrap_or_default(),
            is_active: map.get("is_active").and_then(Value::as_bool).unwrap_or(false),
            active_request: map
                .get("active_request")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        _ => SessionQueueSnapshot::default(),
    }
}

fn parse_queued(value: &Value) -> QueuedRequest {
    QueuedRequest {
        request_id: value
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        data: value.get("data").cloned().unwrap_or_else(|| {
            // Some services hand the request payload directly.
            let mut map = value.as_object().cloned().unwrap_or(Map::new());
            map.remove("request_id");
            map.remove("timestamp");
            Value::Object(map)
        }),
        timestamp: value
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn parse_request(value: &Value) -> RequestSnapshot {
    RequestSnapshot {
        session_id: value
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        status: value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        data: value.get("data").cloned().unwrap_or(Value::Null),
        queued_at: str_field(value, "queued_at"),
        started_at: str_field(value, "started_at"),
        completed_at: str_field(value, "completed_at"),
        error: str_field(value, "error"),
    }
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
#[path = "checkpoint_tests.rs"]
mod tests;
