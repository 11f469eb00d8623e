// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dynamic routing control plane.
//!
//! Agents install, modify, and tear down routing rules at runtime. Every
//! rule is realized as a transformer in the router; the rule map is kept
//! behind an immutable snapshot that swaps on write so the emit path
//! never takes this service's lock. Mutating calls require the
//! `routing_control` capability (the synthetic `system` identity
//! bypasses the check). TTL expiry runs once per minute and
//! opportunistically on queries; parent-scoped rules are removed when
//! their owning entity terminates.

use crate::handler::{handler_fn, priority, EventContext, HandlerResult};
use crate::response::{error_response, is_success, success_response};
use crate::router::{EventRouter, RouterHandle};
use crate::transformer::SourceGuard;
use ksi_core::{Clock, IdGen, RuleId};
use ksi_transform::TransformerDef;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Binding of a rule to another entity's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentScope {
    #[serde(rename = "type")]
    pub scope_type: String,
    pub id: String,
}

/// A runtime routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub rule_id: String,
    pub source_pattern: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Value>,
    /// Expand the target over a list in the event data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,
    pub priority: i64,
    /// Time-to-live in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_scope: Option<ParentScope>,
    pub created_by: String,
    /// Epoch seconds.
    pub created_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<f64>,
}

impl RoutingRule {
    fn is_expired(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    fn to_transformer(&self) -> TransformerDef {
        TransformerDef {
            name: Some(self.rule_id.clone()),
            source: self.source_pattern.clone(),
            target: self.target.clone(),
            condition: self.condition.clone(),
            // Absent mapping means the original data passes through.
            mapping: self.mapping.clone(),
            is_async: false,
            foreach: self.foreach.clone(),
            response_route: None,
        }
    }
}

/// Append-only audit record of routing mutations.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub op: String,
    pub rule_id: Option<String>,
    pub agent_id: String,
    pub timestamp: f64,
    pub payload: Value,
}

#[derive(Debug, Default, Clone, Serialize)]
struct RoutingMetrics {
    rules_created: u64,
    rules_modified: u64,
    rules_deleted: u64,
    rules_expired: u64,
}

/// The routing service.
pub struct RoutingService {
    rules: RwLock<Arc<HashMap<String, RoutingRule>>>,
    subscriptions: Mutex<HashMap<String, Value>>,
    audit: Mutex<Vec<AuditEntry>>,
    metrics: Mutex<RoutingMetrics>,
    idgen: Arc<dyn IdGen>,
    clock: Arc<dyn Clock>,
}

impl RoutingService {
    pub fn new(idgen: Arc<dyn IdGen>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            rules: RwLock::new(Arc::new(HashMap::new())),
            subscriptions: Mutex::new(HashMap::new()),
            audit: Mutex::new(Vec::new()),
            metrics: Mutex::new(RoutingMetrics::default()),
            idgen,
            clock,
        })
    }

    /// Register the `routing:*` event surface and parent-scope cleanup
    /// handlers.
    pub fn register(self: &Arc<Self>, router: &EventRouter) {
        let module = "routing";

        macro_rules! route {
            ($event:expr, $method:ident) => {{
                let service = Arc::clone(self);
                router.register_handler(
                    module,
                    $event,
                    priority::NORMAL,
                    handler_fn(move |data, ctx| {
                        let service = Arc::clone(&service);
                        async move { service.$method(data, ctx).await }
                    }),
                );
            }};
        }

        route!("routing:add_rule", add_rule);
        route!("routing:modify_rule", modify_rule);
        route!("routing:delete_rule", delete_rule);
        route!("routing:query_rules", query_rules);
        route!("routing:get_audit_log", get_audit_log);
        route!("routing:update_subscription", update_subscription);
        route!("routing:spawn_with_routing", spawn_with_routing);

        for event in [
            "agent:terminated",
            "orchestration:terminated",
            "workflow:terminated",
        ] {
            let service = Arc::clone(self);
            let scope_type = event.split(':').next().unwrap_or("agent").to_string();
            router.register_handler(
                module,
                event,
                priority::HIGH,
                handler_fn(move |data, ctx| {
                    let service = Arc::clone(&service);
                    let scope_type = scope_type.clone();
                    async move { service.on_entity_terminated(&scope_type, data, ctx).await }
                }),
            );
        }

        // Catch-all for termination events that only surface as entity
        // deletions.
        let service = Arc::clone(self);
        router.register_handler(
            module,
            "state:entity:deleted",
            priority::HIGH,
            handler_fn(move |data, ctx| {
                let service = Arc::clone(&service);
                async move {
                    let scope_type = data
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if !matches!(scope_type.as_str(), "agent" | "orchestration" | "workflow") {
                        return Ok(None);
                    }
                    service.on_entity_terminated(&scope_type, data, ctx).await
                }
            }),
        );
    }

    /// Background sweep removing expired rules once per interval.
    pub async fn ttl_task(self: Arc<Self>, handle: RouterHandle, interval: Duration) -> Result<(), String> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let expired = self.expire_due_rules(&handle).await;
            if expired > 0 {
                info!(expired, "expired routing rules");
            }
        }
    }

    /// Remove every rule whose TTL has elapsed, emitting
    /// `routing:rule_expired` for each. Returns how many were removed.
    pub async fn expire_due_rules(&self, handle: &RouterHandle) -> usize {
        let now = self.clock.timestamp();
        let expired: Vec<RoutingRule> = {
            let rules = self.rules.read();
            rules.values().filter(|r| r.is_expired(now)).cloned().collect()
        };

        for rule in &expired {
            self.remove_rule_internal(&rule.rule_id, handle);
            self.metrics.lock().rules_expired += 1;
            self.push_audit("expire_rule", Some(rule.rule_id.as_str()), "system", json!({"ttl": rule.ttl}));
            let _ = handle
                .emit(
                    "routing:rule_expired",
                    json!({"rule_id": rule.rule_id, "expired_at": now}),
                )
                .await;
        }
        expired.len()
    }

    /// Remove all rules scoped to a terminated entity, in a single pass.
    pub fn cleanup_parent_rules(&self, scope_type: &str, id: &str, handle: &RouterHandle) -> usize {
        let doomed: Vec<String> = {
            let rules = self.rules.read();
            rules
                .values()
                .filter(|r| {
                    r.parent_scope
                        .as_ref()
                        .is_some_and(|s| s.scope_type == scope_type && s.id == id)
                })
                .map(|r| r.rule_id.clone())
                .collect()
        };

        for rule_id in &doomed {
            self.remove_rule_internal(rule_id, handle);
            self.push_audit(
                "parent_cleanup",
                Some(rule_id.as_str()),
                "system",
                json!({"scope_type": scope_type, "scope_id": id}),
            );
        }
        doomed.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    fn remove_rule_internal(&self, rule_id: &str, handle: &RouterHandle) {
        {
            let mut rules = self.rules.write();
            let mut next = (**rules).clone();
            next.remove(rule_id);
            *rules = Arc::new(next);
        }
        if let Err(e) = handle.unregister_rule_transformers(&RuleId::new(rule_id)) {
            warn!(rule_id, error = %e, "failed to unregister rule transformers");
        }
    }

    fn insert_rule(&self, rule: RoutingRule, handle: &RouterHandle) -> Result<(), String> {
        handle
            .register_transformer(
                rule.to_transformer(),
                Some(RuleId::new(&rule.rule_id)),
                rule.priority,
                None::<SourceGuard>,
            )
            .map_err(|e| e.to_string())?;

        let mut rules = self.rules.write();
        let mut next = (**rules).clone();
        next.insert(rule.rule_id.clone(), rule);
        *rules = Arc::new(next);
        Ok(())
    }

    fn push_audit(&self, op: &str, rule_id: Option<&str>, agent_id: &str, payload: Value) {
        self.audit.lock().push(AuditEntry {
            op: op.to_string(),
            rule_id: rule_id.map(str::to_string),
            agent_id: agent_id.to_string(),
            timestamp: self.clock.timestamp(),
            payload,
        });
    }

    /// Check the caller's `routing_control` capability via the state
    /// store. Returns an error response when the check fails.
    async fn check_capability(&self, ctx: &EventContext) -> Option<Value> {
        let agent_id = ctx
            .context
            .agent_id
            .as_ref()
            .map_or("system", |a| a.as_str())
            .to_string();
        if agent_id == "system" {
            return None;
        }

        let result = ctx
            .emit_first("state:entity:get", json!({"type": "agent", "id": agent_id}))
            .await
            .ok()
            .flatten();

        match result {
            Some(resp) if is_success(&resp) => {
                let capabilities: Vec<String> = resp["data"]["entity"]["properties"]["capabilities"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                if capabilities.iter().any(|c| c == "routing_control") {
                    None
                } else {
                    Some(error_response(
                        "Permission denied",
                        Some(json!({
                            "required_capability": "routing_control",
                            "agent_capabilities": capabilities,
                        })),
                    ))
                }
            }
            _ => Some(error_response(
                "Unable to verify agent capabilities",
                Some(json!({"agent_id": agent_id})),
            )),
        }
    }

    async fn add_rule(self: Arc<Self>, data: Value, ctx: EventContext) -> HandlerResult {
        if let Some(denied) = self.check_capability(&ctx).await {
            return Ok(Some(denied));
        }
        let agent_id = agent_of(&ctx);

        let Some(source_pattern) = data.get("source_pattern").and_then(Value::as_str) else {
            return Ok(Some(missing_fields(&["source_pattern", "target"])));
        };
        let Some(target) = data.get("target").and_then(Value::as_str) else {
            return Ok(Some(missing_fields(&["source_pattern", "target"])));
        };

        if source_pattern == target {
            return Ok(Some(error_response(
                "Circular routing detected",
                Some(json!({"source_pattern": source_pattern, "target": target})),
            )));
        }

        let rule_id = data
            .get("rule_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.idgen.rule_id().as_str().to_string());

        if self.rules.read().contains_key(&rule_id) {
            return Ok(Some(error_response(
                "Rule ID already exists",
                Some(json!({"rule_id": rule_id})),
            )));
        }

        let now = self.clock.timestamp();
        let ttl = int_field(&data, "ttl").map(|t| t.max(0) as u64);
        let rule = RoutingRule {
            rule_id: rule_id.clone(),
            source_pattern: source_pattern.to_string(),
            target: target.to_string(),
            condition: data
                .get("condition")
                .and_then(Value::as_str)
                .map(str::to_string),
            mapping: parse_mapping(data.get("mapping")),
            foreach: data
                .get("foreach")
                .and_then(Value::as_str)
                .map(str::to_string),
            priority: int_field(&data, "priority").unwrap_or(100),
            ttl,
            parent_scope: data
                .get("parent_scope")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            created_by: agent_id.clone(),
            created_at: now,
            expires_at: ttl.map(|t| now + t as f64),
        };

        if let Err(e) = self.insert_rule(rule.clone(), &ctx.handle) {
            return Ok(Some(error_response(
                "Failed to add routing rule",
                Some(json!({"reason": e})),
            )));
        }

        self.metrics.lock().rules_created += 1;
        self.push_audit(
            "add_rule",
            Some(rule_id.as_str()),
            &agent_id,
            serde_json::to_value(&rule).unwrap_or(Value::Null),
        );
        info!(rule_id = %rule_id, source = %rule.source_pattern, target = %rule.target, "routing rule added");

        Ok(Some(success_response(json!({
            "rule_id": rule_id,
            "status": "created",
            "rule": rule,
        }))))
    }

    async fn modify_rule(self: Arc<Self>, data: Value, ctx: EventContext) -> HandlerResult {
        if let Some(denied) = self.check_capability(&ctx).await {
            return Ok(Some(denied));
        }
        let agent_id = agent_of(&ctx);

        let Some(rule_id) = data.get("rule_id").and_then(Value::as_str) else {
            return Ok(Some(error_response("Missing rule_id", None)));
        };
        let Some(updates) = data.get("updates").and_then(Value::as_object) else {
            return Ok(Some(error_response(
                "Invalid updates format",
                Some(json!({"expected": "JSON object"})),
            )));
        };

        let mut rule = match self.rules.read().get(rule_id) {
            Some(rule) => rule.clone(),
            None => {
                return Ok(Some(error_response(
                    "Rule not found",
                    Some(json!({"rule_id": rule_id})),
                )))
            }
        };

        for (key, value) in updates {
            match key.as_str() {
                "source_pattern" => {
                    if let Some(s) = value.as_str() {
                        rule.source_pattern = s.to_string();
                    }
                }
                "target" => {
                    if let Some(s) = value.as_str() {
                        rule.target = s.to_string();
                    }
                }
                "condition" => {
                    rule.condition = value.as_str().map(str::to_string);
                }
                "mapping" => {
                    rule.mapping = parse_mapping(Some(value));
                }
                "foreach" => {
                    rule.foreach = value.as_str().map(str::to_string);
                }
                "priority" => {
                    if let Some(p) = int_value(value) {
                        rule.priority = p;
                    }
                }
                "ttl" => {
                    let now = self.clock.timestamp();
                    match int_value(value) {
                        Some(ttl) if ttl > 0 => {
                            rule.ttl = Some(ttl as u64);
                            rule.expires_at = Some(now + ttl as f64);
                        }
                        _ => {
                            rule.ttl = None;
                            rule.expires_at = None;
                        }
                    }
                }
                "parent_scope" => {
                    rule.parent_scope = serde_json::from_value(value.clone()).ok();
                }
                // Identity fields are immutable.
                "rule_id" | "created_by" | "created_at" => {}
                other => {
                    warn!(rule_id, field = other, "ignoring unknown rule field in update");
                }
            }
        }

        if rule.source_pattern == rule.target {
            return Ok(Some(error_response(
                "Circular routing detected",
                Some(json!({"source_pattern": rule.source_pattern, "target": rule.target})),
            )));
        }

        // Re-register: drop the old transformer, install the new one.
        self.remove_rule_internal(rule_id, &ctx.handle);
        if let Err(e) = self.insert_rule(rule.clone(), &ctx.handle) {
            return Ok(Some(error_response(
                "Failed to modify routing rule",
                Some(json!({"reason": e})),
            )));
        }

        self.metrics.lock().rules_modified += 1;
        self.push_audit(
            "modify_rule",
            Some(rule_id),
            &agent_id,
            json!({"updates": updates}),
        );
        info!(rule_id, "routing rule modified");

        Ok(Some(success_response(json!({
            "rule_id": rule_id,
            "status": "modified",
            "rule": rule,
        }))))
    }

    async fn delete_rule(self: Arc<Self>, data: Value, ctx: EventContext) -> HandlerResult {
        if let Some(denied) = self.check_capability(&ctx).await {
            return Ok(Some(denied));
        }
        let agent_id = agent_of(&ctx);

        let Some(rule_id) = data.get("rule_id").and_then(Value::as_str) else {
            return Ok(Some(error_response("Missing rule_id", None)));
        };

        let deleted = self.rules.read().get(rule_id).cloned();
        let Some(deleted) = deleted else {
            return Ok(Some(error_response(
                "Rule not found",
                Some(json!({"rule_id": rule_id})),
            )));
        };

        self.remove_rule_internal(rule_id, &ctx.handle);
        self.metrics.lock().rules_deleted += 1;
        self.push_audit(
            "delete_rule",
            Some(rule_id),
            &agent_id,
            serde_json::to_value(&deleted).unwrap_or(Value::Null),
        );
        info!(rule_id, "routing rule deleted");

        Ok(Some(success_response(json!({
            "rule_id": rule_id,
            "status": "deleted",
        }))))
    }

    async fn query_rules(self: Arc<Self>, data: Value, ctx: EventContext) -> HandlerResult {
        // Opportunistic expiry so queries never report dead rules.
        self.expire_due_rules(&ctx.handle).await;

        let filter = data.get("filter").cloned().unwrap_or(Value::Null);
        let limit = data.get("limit").and_then(Value::as_u64).unwrap_or(100) as usize;

        let rules = self.rules.read().clone();
        let mut filtered: Vec<RoutingRule> = rules
            .values()
            .filter(|rule| {
                if let Some(scope) = filter.get("agent_scope").and_then(Value::as_str) {
                    if rule.created_by != scope {
                        return false;
                    }
                }
                if let Some(prefix) = filter.get("source_pattern").and_then(Value::as_str) {
                    if !rule.source_pattern.starts_with(prefix) {
                        return false;
                    }
                }
                if let Some(target) = filter.get("target").and_then(Value::as_str) {
                    if rule.target != target {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        filtered.sort_by(|a, b| b.priority.cmp(&a.priority));
        filtered.truncate(limit);

        Ok(Some(success_response(json!({
            "rules": filtered,
            "count": filtered.len(),
            "total": rules.len(),
        }))))
    }

    async fn get_audit_log(self: Arc<Self>, data: Value, ctx: EventContext) -> HandlerResult {
        if let Some(denied) = self.check_capability(&ctx).await {
            return Ok(Some(denied));
        }

        let limit = data.get("limit").and_then(Value::as_u64).unwrap_or(100) as usize;
        let since = data.get("since").and_then(Value::as_f64);
        let operation = data.get("operation").and_then(Value::as_str);

        let audit = self.audit.lock();
        let total = audit.len();
        let mut entries: Vec<AuditEntry> = audit
            .iter()
            .filter(|e| since.is_none_or(|s| e.timestamp > s))
            .filter(|e| operation.is_none_or(|op| e.op == op))
            .cloned()
            .collect();
        drop(audit);

        entries.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));
        entries.truncate(limit);

        Ok(Some(success_response(json!({
            "entries": entries,
            "count": entries.len(),
            "total": total,
        }))))
    }

    async fn update_subscription(self: Arc<Self>, data: Value, ctx: EventContext) -> HandlerResult {
        if let Some(denied) = self.check_capability(&ctx).await {
            return Ok(Some(denied));
        }
        let requesting = agent_of(&ctx);

        let Some(target_agent) = data.get("agent_id").and_then(Value::as_str) else {
            return Ok(Some(missing_fields(&["agent_id", "subscription_level"])));
        };
        let Some(level) = data.get("subscription_level") else {
            return Ok(Some(missing_fields(&["agent_id", "subscription_level"])));
        };

        self.subscriptions.lock().insert(
            target_agent.to_string(),
            json!({
                "subscription_level": level,
                "error_subscription_level": data.get("error_subscription_level"),
                "updated_at": self.clock.timestamp(),
                "updated_by": requesting,
            }),
        );

        self.push_audit(
            "update_subscription",
            None,
            &requesting,
            json!({
                "target_agent": target_agent,
                "subscription_level": level,
                "reason": data.get("reason"),
            }),
        );

        Ok(Some(success_response(json!({
            "agent_id": target_agent,
            "subscription_level": level,
            "status": "updated",
        }))))
    }

    async fn spawn_with_routing(self: Arc<Self>, data: Value, ctx: EventContext) -> HandlerResult {
        let requesting = agent_of(&ctx);

        let Some(agent_id) = data.get("agent_id").and_then(Value::as_str) else {
            return Ok(Some(missing_fields(&["agent_id", "component"])));
        };
        let Some(component) = data.get("component").and_then(Value::as_str) else {
            return Ok(Some(missing_fields(&["agent_id", "component"])));
        };
        let routing_config = data.get("routing").cloned().unwrap_or(json!({}));

        // Spawn first so the routing below has an entity to scope to.
        let _ = ctx
            .emit(
                "agent:spawn",
                json!({
                    "agent_id": agent_id,
                    "component": component,
                    "capabilities": routing_config.get("capabilities"),
                }),
            )
            .await;

        // Parent relationship is recorded as a state entity so error
        // propagation can discover ancestors.
        if let Some(parent) = routing_config.get("parent").and_then(Value::as_str) {
            let _ = ctx
                .emit(
                    "state:entity:create",
                    json!({
                        "type": "routing_rule",
                        "id": format!("{parent}_to_{agent_id}"),
                        "properties": {
                            "source_agent": parent,
                            "target_agent": agent_id,
                            "relationship": "parent_child",
                        },
                    }),
                )
                .await;
        }

        // Initial routes are scoped to the spawned agent's lifetime.
        let mut installed = Vec::new();
        if let Some(routes) = routing_config.get("initial_routes").and_then(Value::as_array) {
            for route in routes {
                let mut rule_data = route.clone();
                if let Some(map) = rule_data.as_object_mut() {
                    map.entry("parent_scope")
                        .or_insert(json!({"type": "agent", "id": agent_id}));
                }
                let result = Arc::clone(&self).add_rule(rule_data, ctx.clone()).await?;
                if let Some(result) = result {
                    if is_success(&result) {
                        if let Some(rule_id) = result["data"]["rule_id"].as_str() {
                            installed.push(rule_id.to_string());
                        }
                    }
                }
            }
        }

        self.push_audit(
            "spawn_with_routing",
            None,
            &requesting,
            json!({"agent_id": agent_id, "routes": installed}),
        );

        Ok(Some(success_response(json!({
            "agent_id": agent_id,
            "status": "spawned_with_routing",
            "routing_config": routing_config,
            "installed_routes": installed,
        }))))
    }

    async fn on_entity_terminated(
        self: Arc<Self>,
        scope_type: &str,
        data: Value,
        ctx: EventContext,
    ) -> HandlerResult {
        let id = data
            .get("id")
            .or_else(|| data.get(&format!("{scope_type}_id")))
            .or_else(|| data.get("agent_id"))
            .and_then(Value::as_str);

        let Some(id) = id else {
            return Ok(Some(json!({"status": "ignored", "reason": "missing entity id"})));
        };

        let cleaned = self.cleanup_parent_rules(scope_type, id, &ctx.handle);
        if cleaned > 0 {
            info!(scope_type, id, cleaned, "cleaned up parent-scoped routing rules");
        }
        Ok(Some(json!({"status": "success", "rules_cleaned": cleaned})))
    }
}

fn agent_of(ctx: &EventContext) -> String {
    ctx.context
        .agent_id
        .as_ref()
        .map_or("system", |a| a.as_str())
        .to_string()
}

fn missing_fields(required: &[&str]) -> Value {
    error_response("Missing required fields", Some(json!({"required": required})))
}

/// Accept mappings as objects or JSON-encoded strings.
fn parse_mapping(value: Option<&Value>) -> Option<Value> {
    match value {
        Some(Value::Object(map)) => Some(Value::Object(map.clone())),
        Some(Value::String(s)) => serde_json::from_str(s).ok(),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.clone()),
    }
}

/// Accept integers as numbers or numeric strings.
fn int_field(data: &Value, field: &str) -> Option<i64> {
    data.get(field).and_then(int_value)
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
#[path = "routing_tests.rs"]
mod tests;
