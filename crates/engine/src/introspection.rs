// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event genealogy and routing introspection.
//!
//! The router records the last 1000 routing decisions; this module
//! exposes them along with event chain/tree reconstruction. Chains are
//! served from hot storage and fall back to the reference event log for
//! aged-out events.

use crate::handler::{handler_fn, priority, HandlerResult};
use crate::response::{error_response, success_response};
use crate::router::{EventRouter, RouterHandle};
use ksi_core::matches_pattern;
use ksi_storage::EventQuery;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// One routing decision made while applying transformers to an emission.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub decision_id: String,
    pub event_id: String,
    pub event_name: String,
    /// Every rule/transformer whose source matched the event.
    pub rules_evaluated: Vec<String>,
    /// Those whose condition also held.
    pub rules_matched: Vec<String>,
    /// The winning (highest priority) matched rule.
    pub rule_applied: Option<String>,
    pub transformation_applied: bool,
    pub timestamp: f64,
}

/// Introspection event surface.
pub struct IntrospectionService;

impl IntrospectionService {
    pub fn register(router: &EventRouter) {
        let module = "introspection";
        let handle = router.handle();

        let h = handle.clone();
        router.register_handler(
            module,
            "introspection:event_chain",
            priority::NORMAL,
            handler_fn(move |data, _ctx| {
                let handle = h.clone();
                async move { event_chain(&handle, &data).await }
            }),
        );

        let h = handle.clone();
        router.register_handler(
            module,
            "introspection:event_tree",
            priority::NORMAL,
            handler_fn(move |data, _ctx| {
                let handle = h.clone();
                async move { event_tree(&handle, &data).await }
            }),
        );

        let h = handle.clone();
        router.register_handler(
            module,
            "introspection:routing_decisions",
            priority::NORMAL,
            handler_fn(move |data, _ctx| {
                let handle = h.clone();
                async move { routing_decisions(&handle, &data) }
            }),
        );

        let h = handle;
        router.register_handler(
            module,
            "introspection:routing_impact",
            priority::NORMAL,
            handler_fn(move |data, _ctx| {
                let handle = h.clone();
                async move { routing_impact(&handle, &data) }
            }),
        );
    }
}

fn chain_entry(envelope: &ksi_core::EventEnvelope, context: &ksi_core::ContextRecord) -> Value {
    json!({
        "event_id": &envelope.event_id,
        "event_name": &envelope.event_name,
        "timestamp": envelope.timestamp,
        "data": &envelope.data,
        "_parent_event_id": &context.parent_event_id,
        "_root_event_id": &context.root_event_id,
        "_event_depth": context.event_depth,
        "_correlation_id": &context.correlation_id,
    })
}

async fn event_chain(handle: &RouterHandle, data: &Value) -> HandlerResult {
    let correlation_id = data.get("correlation_id").and_then(Value::as_str);
    let event_id = data.get("event_id").and_then(Value::as_str);
    let root_event_id = data.get("root_event_id").and_then(Value::as_str);
    let include_children = data
        .get("include_children")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let max_depth = data.get("max_depth").and_then(Value::as_i64).unwrap_or(-1);

    if correlation_id.is_none() && event_id.is_none() && root_event_id.is_none() {
        return Ok(Some(error_response(
            "Must provide correlation_id, event_id, or root_event_id",
            None,
        )));
    }

    let contexts = handle.contexts().map_err(to_handler_err)?;

    let mut records: Vec<(ksi_core::EventEnvelope, ksi_core::ContextRecord)> = Vec::new();

    if let Some(corr) = correlation_id {
        for record in contexts.by_correlation(corr) {
            records.push((record.envelope, record.context));
        }
        // Fall back to the reference event log for aged-out chains.
        if records.is_empty() {
            if let Ok(Some(log)) = handle.event_log() {
                let metas = log
                    .query(&EventQuery {
                        correlation_id: Some(corr.to_string()),
                        limit: 1000,
                        newest_first: false,
                        ..Default::default()
                    })
                    .await
                    .unwrap_or_default();
                for meta in metas {
                    if let Ok(Some(envelope)) = log.read_at(&meta.jsonl_file, meta.jsonl_offset).await
                    {
                        if let Some(ctx) = contexts.resolve(&meta.context_ref).await {
                            records.push((envelope, ctx));
                        }
                    }
                }
            }
        }
    } else {
        let start = event_id.or(root_event_id).unwrap_or_default();
        if include_children {
            for record in contexts.chain_from(start) {
                records.push((record.envelope, record.context));
            }
        } else if let Some(record) = contexts.get_hot(start) {
            records.push((record.envelope, record.context));
        }
    }

    if max_depth >= 0 {
        records.retain(|(_, ctx)| i64::from(ctx.event_depth) <= max_depth);
    }
    records.sort_by(|a, b| a.0.timestamp.total_cmp(&b.0.timestamp));

    let chain: Vec<Value> = records
        .iter()
        .map(|(env, ctx)| chain_entry(env, ctx))
        .collect();

    Ok(Some(success_response(json!({
        "chain": chain,
        "total_events": chain.len(),
    }))))
}

async fn event_tree(handle: &RouterHandle, data: &Value) -> HandlerResult {
    let format = data
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or("tree");
    let max_depth = data.get("max_depth").and_then(Value::as_i64).unwrap_or(-1);

    let contexts = handle.contexts().map_err(to_handler_err)?;

    // Resolve the root: explicit event_id, or the depth-0 event of a
    // correlation chain.
    let root_id = match data.get("event_id").and_then(Value::as_str) {
        Some(id) => Some(id.to_string()),
        None => match data.get("correlation_id").and_then(Value::as_str) {
            Some(corr) => contexts
                .by_correlation(corr)
                .iter()
                .find(|r| r.context.event_depth == 0)
                .map(|r| r.envelope.event_id.as_str().to_string()),
            None => None,
        },
    };

    let Some(root_id) = root_id else {
        return Ok(Some(error_response(
            "Must provide event_id or correlation_id",
            None,
        )));
    };

    let Some(root) = contexts.get_hot(&root_id) else {
        return Ok(Some(error_response(
            "Event not found",
            Some(json!({"event_id": root_id})),
        )));
    };

    match format {
        "graph" => {
            let mut nodes = Vec::new();
            let mut edges = Vec::new();
            collect_graph(&contexts, &root_id, 0, max_depth, &mut nodes, &mut edges);
            Ok(Some(success_response(json!({
                "format": "graph",
                "nodes": nodes,
                "edges": edges,
            }))))
        }
        _ => {
            let mut lines = Vec::new();
            lines.push(format!(
                "{} {}",
                root.envelope.event_id, root.envelope.event_name
            ));
            render_tree(&contexts, &root_id, "", 0, max_depth, &mut lines);
            Ok(Some(success_response(json!({
                "format": "tree",
                "tree": lines.join("\n"),
                "root": root.envelope.event_id,
            }))))
        }
    }
}

fn collect_graph(
    contexts: &Arc<crate::context::ContextManager>,
    event_id: &str,
    depth: i64,
    max_depth: i64,
    nodes: &mut Vec<Value>,
    edges: &mut Vec<Value>,
) {
    if let Some(record) = contexts.get_hot(event_id) {
        nodes.push(json!({
            "id": event_id,
            "event_name": record.envelope.event_name,
            "timestamp": record.envelope.timestamp,
            "depth": record.context.event_depth,
        }));
    }
    if max_depth >= 0 && depth >= max_depth {
        return;
    }
    for child in contexts.children_of(event_id) {
        edges.push(json!({"from": event_id, "to": child}));
        collect_graph(contexts, &child, depth + 1, max_depth, nodes, edges);
    }
}

fn render_tree(
    contexts: &Arc<crate::context::ContextManager>,
    event_id: &str,
    prefix: &str,
    depth: i64,
    max_depth: i64,
    lines: &mut Vec<String>,
) {
    if max_depth >= 0 && depth >= max_depth {
        return;
    }
    let children = contexts.children_of(event_id);
    let count = children.len();
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == count;
        let connector = if last { "└── " } else { "├── " };
        let name = contexts
            .get_hot(child)
            .map(|r| r.envelope.event_name)
            .unwrap_or_default();
        lines.push(format!("{prefix}{connector}{child} {name}"));
        let next_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
        render_tree(contexts, child, &next_prefix, depth + 1, max_depth, lines);
    }
}

fn routing_decisions(handle: &RouterHandle, data: &Value) -> HandlerResult {
    let limit = data.get("limit").and_then(Value::as_u64).unwrap_or(100) as usize;
    let event_name = data.get("event_name").and_then(Value::as_str);
    let rule_id = data.get("rule_id").and_then(Value::as_str);

    let mut decisions = handle.decisions().map_err(to_handler_err)?;
    if let Some(name) = event_name {
        decisions.retain(|d| d.event_name == name);
    }
    if let Some(rule) = rule_id {
        decisions.retain(|d| d.rules_evaluated.iter().any(|r| r == rule));
    }

    let total = decisions.len();
    let slice: Vec<&RoutingDecision> = decisions.iter().rev().take(limit).collect();
    Ok(Some(success_response(json!({
        "decisions": slice,
        "count": slice.len(),
        "total": total,
    }))))
}

/// Replay recent decisions against a hypothetical rule to estimate how
/// many events it would have affected.
fn routing_impact(handle: &RouterHandle, data: &Value) -> HandlerResult {
    let patterns: Vec<String> = data
        .get("event_patterns")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if patterns.is_empty() {
        return Ok(Some(error_response("event_patterns required", None)));
    }

    let rule_id = data.get("rule_id").and_then(Value::as_str);
    let time_window = data
        .get("time_window")
        .and_then(Value::as_f64)
        .unwrap_or(3600.0);

    let decisions = handle.decisions().map_err(to_handler_err)?;
    let newest = decisions.last().map_or(0.0, |d| d.timestamp);
    let cutoff = newest - time_window;

    let mut affected = Vec::new();
    let mut already_applied = 0usize;
    for decision in decisions.iter().filter(|d| d.timestamp >= cutoff) {
        if patterns.iter().any(|p| matches_pattern(&decision.event_name, p)) {
            if rule_id.is_some_and(|r| decision.rules_matched.iter().any(|m| m == r)) {
                already_applied += 1;
            }
            affected.push(json!({
                "event_id": decision.event_id,
                "event_name": decision.event_name,
                "timestamp": decision.timestamp,
            }));
        }
    }

    let estimated = affected.len();
    affected.truncate(20);

    Ok(Some(success_response(json!({
        "estimated_affected_events": estimated,
        "already_applied": already_applied,
        "sample": affected,
        "time_window": time_window,
        "patterns": patterns,
    }))))
}

fn to_handler_err(e: crate::router::RouterError) -> crate::handler::HandlerError {
    crate::handler::HandlerError::service(e.to_string())
}

#[cfg(test)]
#[path = "introspection_tests.rs"]
mod tests;
