// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Universal error handler.
//!
//! Consumes every `system:error` emission: persists the error as a state
//! entity, routes it back to its originator, propagates it up the agent
//! hierarchy according to the agent's `error_propagation_level`, and
//! escalates critical kinds to `monitor:critical_error`. Recoverable
//! kinds trigger `error:recovery:attempt` with a retry strategy; the
//! retry itself is the owning service's job.

use crate::handler::{handler_fn, priority, EventContext, HandlerResult};
use crate::router::EventRouter;
use ksi_core::ErrorKind;
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Propagation levels: 0 none, 1 direct parents, 2 grandparents,
/// -1 all ancestors.
const DEFAULT_PROPAGATION_LEVEL: i64 = 1;

pub struct ErrorHandlerService;

impl ErrorHandlerService {
    pub fn register(router: &EventRouter) {
        router.register_handler(
            "error_handler",
            "system:error",
            priority::HIGH,
            handler_fn(move |data, ctx| async move { handle_system_error(data, ctx).await }),
        );
    }
}

async fn handle_system_error(data: Value, ctx: EventContext) -> HandlerResult {
    let error_type = data
        .get("error_type")
        .and_then(Value::as_str)
        .unwrap_or("handler_failure");
    let error_message = data
        .get("error_message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let kind: ErrorKind = serde_json::from_value(json!(error_type))
        .unwrap_or(ErrorKind::HandlerFailure);
    let error_context = data.get("_ksi_context").cloned().unwrap_or(json!({}));

    // 1. Persist for debugging and monitoring.
    let error_id = format!("error_{}", ctx.context.event_id);
    let _ = ctx
        .emit(
            "state:entity:create",
            json!({
                "type": "error",
                "id": &error_id,
                "properties": {
                    "error_type": error_type,
                    "error_class": data.get("error_class"),
                    "error_message": error_message,
                    "source": data.get("source"),
                    "original_data": data.get("original_data"),
                    "context": error_context,
                },
            }),
        )
        .await;

    // 2. Route to the originator based on its client id.
    let client_id = error_context
        .get("_client_id")
        .and_then(Value::as_str)
        .or_else(|| ctx.context.client_id.as_ref().map(|c| c.as_str()));
    if let Some(client_id) = client_id {
        if let Some(agent) = client_id.strip_prefix("agent_") {
            let _ = ctx
                .emit(
                    "completion:inject",
                    json!({
                        "agent_id": format!("agent_{agent}"),
                        "notification": "error",
                        "error_type": error_type,
                        "error_message": error_message,
                        "error_id": &error_id,
                    }),
                )
                .await;
        } else if client_id.starts_with("workflow_") {
            let _ = ctx
                .emit(
                    "workflow:error",
                    json!({
                        "workflow_id": client_id,
                        "error_type": error_type,
                        "error_message": error_message,
                        "error_id": &error_id,
                    }),
                )
                .await;
        }
        // CLI clients get the error in the direct response; nothing to
        // push here.
    }

    // 3. Hierarchical propagation to parent agents.
    let agent_id = error_context
        .get("_agent_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| ctx.context.agent_id.as_ref().map(|a| a.as_str().to_string()));
    if let Some(agent_id) = agent_id {
        let level = propagation_level(&ctx, &agent_id).await;
        if level != 0 {
            let parents = find_parent_agents(&ctx, &agent_id, level).await;
            debug!(agent = %agent_id, parents = parents.len(), "propagating error to ancestors");
            for parent in parents {
                let _ = ctx
                    .emit(
                        "completion:inject",
                        json!({
                            "agent_id": parent,
                            "notification": "child_error",
                            "child_agent": agent_id,
                            "error_type": error_type,
                            "error_message": error_message,
                            "error_id": &error_id,
                        }),
                    )
                    .await;
            }
        }
    }

    // 4. Escalation and recovery.
    if kind.is_critical() {
        let _ = ctx
            .emit(
                "monitor:critical_error",
                json!({
                    "error_type": error_type,
                    "error_message": error_message,
                    "error_id": &error_id,
                    "source": data.get("source"),
                }),
            )
            .await;
    } else if kind.is_recoverable() {
        let _ = ctx
            .emit(
                "error:recovery:attempt",
                json!({
                    "error_type": error_type,
                    "error_id": &error_id,
                    "original_data": data.get("original_data"),
                    "retry_strategy": {
                        "max_attempts": 3,
                        "backoff": "exponential",
                        "initial_delay_ms": 1000,
                    },
                }),
            )
            .await;
    }

    Ok(Some(json!({"status": "handled", "error_id": error_id})))
}

async fn propagation_level(ctx: &EventContext, agent_id: &str) -> i64 {
    let resp = ctx
        .emit_first("state:entity:get", json!({"type": "agent", "id": agent_id}))
        .await
        .ok()
        .flatten();
    resp.as_ref()
        .and_then(|r| r["data"]["entity"]["properties"]["error_propagation_level"].as_i64())
        .unwrap_or(DEFAULT_PROPAGATION_LEVEL)
}

/// Parents are agents with a `parent_child` routing relationship
/// targeting this agent. Walks upward `level` generations (-1 = all).
async fn find_parent_agents(ctx: &EventContext, agent_id: &str, level: i64) -> Vec<String> {
    let mut parents: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(agent_id.to_string());

    let mut frontier = vec![agent_id.to_string()];
    let mut remaining = level;

    while !frontier.is_empty() && remaining != 0 {
        let mut next_frontier = Vec::new();
        for child in &frontier {
            let resp = ctx
                .emit_first(
                    "state:entity:query",
                    json!({
                        "type": "routing_rule",
                        "where": {
                            "properties.target_agent": child,
                            "properties.relationship": "parent_child",
                        },
                    }),
                )
                .await
                .ok()
                .flatten();

            let Some(resp) = resp else {
                warn!(agent = %child, "parent lookup failed");
                continue;
            };
            if let Some(entities) = resp["data"]["entities"].as_array() {
                for entity in entities {
                    if let Some(parent) = entity["properties"]["source_agent"].as_str() {
                        if seen.insert(parent.to_string()) {
                            parents.push(parent.to_string());
                            next_frontier.push(parent.to_string());
                        }
                    }
                }
            }
        }
        frontier = next_frontier;
        if remaining > 0 {
            remaining -= 1;
        }
    }

    parents
}

#[cfg(test)]
#[path = "error_handler_tests.rs"]
mod tests;
