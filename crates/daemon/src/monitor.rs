// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Monitor module: event log queries plus broadcast delivery.
//!
//! Transports register a writer per connected client; the universal
//! broadcast transformer turns every eligible emission into a
//! `monitor:broadcast_event`, and the terminal handler here pushes it to
//! each subscribed client whose patterns match. Broadcast never
//! recurses: `transport:*` chatter and the monitor's own events are
//! excluded at the transformer guard.

use ksi_core::{matches_pattern, Clock};
use ksi_engine::{
    error_response, handler_fn, success_response, EventRouter, SourceGuard,
};
use ksi_storage::EventQuery;
use ksi_transform::TransformerDef;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One observer's broadcast subscription.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub observer_id: String,
    pub target_id: String,
    pub event_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub sampling_rate: f64,
    pub created_at: f64,
    pub active: bool,
}

#[derive(Default)]
struct SubscriptionRegistry {
    by_observer: HashMap<String, Subscription>,
    /// target -> observers watching it.
    by_target: HashMap<String, Vec<String>>,
    /// observer -> targets it watches.
    observer_targets: HashMap<String, HashSet<String>>,
    /// Deterministic sampling counters per observer.
    delivery_counts: HashMap<String, u64>,
}

impl SubscriptionRegistry {
    fn insert(&mut self, sub: Subscription) {
        self.remove(&sub.observer_id);
        self.by_target
            .entry(sub.target_id.clone())
            .or_default()
            .push(sub.observer_id.clone());
        self.observer_targets
            .entry(sub.observer_id.clone())
            .or_default()
            .insert(sub.target_id.clone());
        self.by_observer.insert(sub.observer_id.clone(), sub);
    }

    fn remove(&mut self, observer_id: &str) -> Option<Subscription> {
        let sub = self.by_observer.remove(observer_id)?;
        if let Some(observers) = self.by_target.get_mut(&sub.target_id) {
            observers.retain(|o| o != observer_id);
            if observers.is_empty() {
                self.by_target.remove(&sub.target_id);
            }
        }
        self.observer_targets.remove(observer_id);
        self.delivery_counts.remove(observer_id);
        Some(sub)
    }
}

/// The monitor service.
pub struct MonitorService {
    subs: Mutex<SubscriptionRegistry>,
    writers: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    clock: Arc<dyn Clock>,
}

impl MonitorService {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            subs: Mutex::new(SubscriptionRegistry::default()),
            writers: Mutex::new(HashMap::new()),
            clock,
        })
    }

    /// Install the module's handlers plus the universal broadcast
    /// transformer.
    pub fn register(self: &Arc<Self>, router: &EventRouter) {
        let module = "monitor";

        router.register_transformer(
            TransformerDef {
                name: Some("universal_broadcast".to_string()),
                source: "*".to_string(),
                target: "monitor:broadcast_event".to_string(),
                condition: None,
                mapping: Some(json!({
                    "event_name": "{{_event_name}}",
                    "event_data": "{{$}}",
                    "broadcast_metadata": {
                        "originator_agent": "{{_agent_id|system}}",
                        "timestamp": "{{timestamp_utc()}}",
                        "subscription_required": true,
                    },
                })),
                is_async: true,
                foreach: None,
                response_route: None,
            },
            None,
            0,
            Some(SourceGuard {
                exclude_prefixes: vec!["transport:".to_string()],
                exclude_events: vec![
                    "monitor:subscribe".to_string(),
                    "monitor:broadcast_event".to_string(),
                ],
            }),
        );

        macro_rules! route {
            ($event:expr, $method:ident) => {{
                let service = Arc::clone(self);
                router.register_handler(
                    module,
                    $event,
                    ksi_engine::handler::priority::NORMAL,
                    handler_fn(move |data, ctx| {
                        let service = Arc::clone(&service);
                        async move { service.$method(data, ctx).await }
                    }),
                );
            }};
        }

        route!("monitor:subscribe", subscribe);
        route!("monitor:unsubscribe", unsubscribe);
        route!("monitor:broadcast_event", broadcast);
        route!("monitor:get_events", get_events);
        route!("monitor:get_status", get_status);
    }

    /// Register a connection's writer; pushed broadcast lines go through
    /// it. Called by transports.
    pub fn register_client_writer(&self, client_id: &str, writer: mpsc::UnboundedSender<String>) {
        self.writers.lock().insert(client_id.to_string(), writer);
        debug!(client_id, "registered client writer");
    }

    /// Drop a connection's writer and subscription.
    pub fn unregister_client_writer(&self, client_id: &str) {
        self.writers.lock().remove(client_id);
        self.subs.lock().remove(client_id);
        debug!(client_id, "unregistered client writer");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().by_observer.len()
    }

    async fn subscribe(
        self: Arc<Self>,
        data: Value,
        ctx: ksi_engine::EventContext,
    ) -> ksi_engine::HandlerResult {
        let client_id = data
            .get("client_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| ctx.context.client_id.as_ref().map(|c| c.as_str().to_string()));
        let Some(client_id) = client_id else {
            return Ok(Some(error_response("Missing client_id", None)));
        };

        let patterns: Vec<String> = data
            .get("patterns")
            .or_else(|| data.get("event_patterns"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec!["*".to_string()]);

        let sub = Subscription {
            observer_id: client_id.clone(),
            target_id: data
                .get("target_id")
                .and_then(Value::as_str)
                .unwrap_or("*")
                .to_string(),
            event_patterns: patterns.clone(),
            exclude_patterns: data
                .get("exclude_patterns")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            sampling_rate: data
                .get("sampling_rate")
                .and_then(Value::as_f64)
                .unwrap_or(1.0)
                .clamp(0.0, 1.0),
            created_at: self.clock.timestamp(),
            active: true,
        };
        self.subs.lock().insert(sub);

        Ok(Some(success_response(json!({
            "client_id": client_id,
            "patterns": patterns,
            "status": "subscribed",
        }))))
    }

    async fn unsubscribe(
        self: Arc<Self>,
        data: Value,
        ctx: ksi_engine::EventContext,
    ) -> ksi_engine::HandlerResult {
        let client_id = data
            .get("client_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| ctx.context.client_id.as_ref().map(|c| c.as_str().to_string()));
        let Some(client_id) = client_id else {
            return Ok(Some(error_response("Missing client_id", None)));
        };

        let removed = self.subs.lock().remove(&client_id).is_some();
        Ok(Some(success_response(json!({
            "client_id": client_id,
            "removed": removed,
        }))))
    }

    /// Terminal broadcast handler: fan the event out to matching
    /// subscribers.
    async fn broadcast(
        self: Arc<Self>,
        data: Value,
        _ctx: ksi_engine::EventContext,
    ) -> ksi_engine::HandlerResult {
        let Some(event_name) = data.get("event_name").and_then(Value::as_str) else {
            return Ok(None);
        };
        let event_data = data.get("event_data").cloned().unwrap_or(Value::Null);
        let metadata = data.get("broadcast_metadata").cloned();

        let recipients: Vec<String> = {
            let mut guard = self.subs.lock();
            let registry = &mut *guard;
            let observer_ids: Vec<String> = registry.by_observer.keys().cloned().collect();
            observer_ids
                .into_iter()
                .filter(|observer| {
                    let Some(sub) = registry.by_observer.get(observer) else {
                        return false;
                    };
                    if !sub.active {
                        return false;
                    }
                    let included = sub
                        .event_patterns
                        .iter()
                        .any(|p| matches_pattern(event_name, p));
                    let excluded = sub
                        .exclude_patterns
                        .iter()
                        .any(|p| matches_pattern(event_name, p));
                    if !included || excluded {
                        return false;
                    }
                    let rate = sub.sampling_rate;
                    let count = registry.delivery_counts.entry(observer.clone()).or_insert(0);
                    let n = *count;
                    *count += 1;
                    // Deterministic sampling: deliver when the scaled
                    // counter crosses an integer boundary.
                    ((n as f64 * rate).floor() as u64) < (((n + 1) as f64 * rate).floor() as u64)
                })
                .collect()
        };

        if recipients.is_empty() {
            return Ok(None);
        }

        let mut message = json!({
            "event": event_name,
            "data": event_data,
            "timestamp": self.clock.timestamp(),
        });
        if let Some(metadata) = metadata {
            if let Some(map) = message.as_object_mut() {
                map.insert("broadcast_metadata".to_string(), metadata);
            }
        }
        let line = message.to_string();

        let mut dead = Vec::new();
        {
            let writers = self.writers.lock();
            for client_id in &recipients {
                match writers.get(client_id) {
                    Some(writer) => {
                        if writer.send(line.clone()).is_err() {
                            dead.push(client_id.clone());
                        }
                    }
                    None => dead.push(client_id.clone()),
                }
            }
        }
        for client_id in dead {
            warn!(client_id = %client_id, "dropping dead broadcast client");
            self.unregister_client_writer(&client_id);
        }

        Ok(None)
    }

    async fn get_events(
        self: Arc<Self>,
        data: Value,
        ctx: ksi_engine::EventContext,
    ) -> ksi_engine::HandlerResult {
        let Ok(Some(log)) = ctx.handle.event_log() else {
            return Ok(Some(error_response("Reference event log not available", None)));
        };

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

        let query = EventQuery {
            name_pattern: patterns.first().cloned(),
            correlation_id: data
                .get("correlation_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            agent_id: data
                .get("originator_id")
                .or_else(|| data.get("agent_id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            since: data.get("since").and_then(Value::as_f64),
            until: data.get("until").and_then(Value::as_f64),
            limit: data.get("limit").and_then(Value::as_u64).unwrap_or(100) as u32,
            newest_first: data.get("reverse").and_then(Value::as_bool).unwrap_or(true),
        };

        let metas = match log.query(&query).await {
            Ok(metas) => metas,
            Err(e) => {
                return Ok(Some(error_response(
                    "Query failed",
                    Some(json!({"reason": e.to_string()})),
                )))
            }
        };

        // Additional patterns beyond the first are matched in memory.
        let metas: Vec<_> = metas
            .into_iter()
            .filter(|m| {
                patterns.len() <= 1
                    || patterns.iter().any(|p| matches_pattern(&m.event_name, p))
            })
            .collect();

        let mut events = Vec::with_capacity(metas.len());
        for meta in &metas {
            if let Ok(Some(envelope)) = log.read_at(&meta.jsonl_file, meta.jsonl_offset).await {
                events.push(serde_json::to_value(&envelope).unwrap_or(Value::Null));
            }
        }

        Ok(Some(success_response(json!({
            "events": events,
            "count": events.len(),
            "total_events": metas.len(),
        }))))
    }

    async fn get_status(
        self: Arc<Self>,
        _data: Value,
        ctx: ksi_engine::EventContext,
    ) -> ksi_engine::HandlerResult {
        let subs = self.subs.lock();
        let subscriptions: Vec<&Subscription> = subs.by_observer.values().collect();
        let status = json!({
            "subscriptions": subscriptions,
            "subscriber_count": subscriptions.len(),
            "client_writers": self.writers.lock().len(),
            "events_emitted": ctx.handle.events_emitted().unwrap_or(0),
        });
        drop(subs);
        Ok(Some(success_response(status)))
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
