// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! State entity store.
//!
//! A small in-memory entity map behind the `state:entity:*` event
//! surface. The routing service reads agent capabilities from it, the
//! error handler persists error entities into it, and the checkpoint
//! engine snapshots its agent/identity entities. Deleting an entity
//! emits `state:entity:deleted` so parent-scoped routing rules can be
//! torn down.

use crate::handler::{handler_fn, priority, EventContext, HandlerResult};
use crate::response::{error_response, success_response};
use crate::router::EventRouter;
use ksi_core::Clock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
    #[serde(default)]
    pub properties: Value,
    pub created_at: f64,
    pub updated_at: f64,
}

fn key(entity_type: &str, id: &str) -> String {
    format!("{entity_type}:{id}")
}

/// The entity store.
pub struct StateStore {
    entities: Mutex<HashMap<String, Entity>>,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            entities: Mutex::new(HashMap::new()),
            clock,
        })
    }

    pub fn register(self: &Arc<Self>, router: &EventRouter) {
        let module = "state";

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

        route!("state:entity:create", create);
        route!("state:entity:get", get);
        route!("state:entity:update", update);
        route!("state:entity:delete", delete);
        route!("state:entity:query", query);
        route!("checkpoint:collect", checkpoint_collect);
    }

    /// Direct insert used by restore paths.
    pub fn put(&self, entity_type: &str, id: &str, properties: Value) {
        let now = self.clock.timestamp();
        self.entities.lock().insert(
            key(entity_type, id),
            Entity {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
                properties,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub fn lookup(&self, entity_type: &str, id: &str) -> Option<Entity> {
        self.entities.lock().get(&key(entity_type, id)).cloned()
    }

    pub fn count(&self) -> usize {
        self.entities.lock().len()
    }

    async fn create(self: Arc<Self>, data: Value, _ctx: EventContext) -> HandlerResult {
        let Some(entity_type) = data.get("type").and_then(Value::as_str) else {
            return Ok(Some(error_response("Missing entity type", None)));
        };
        let Some(id) = data.get("id").and_then(Value::as_str) else {
            return Ok(Some(error_response("Missing entity id", None)));
        };
        let properties = data.get("properties").cloned().unwrap_or(json!({}));

        self.put(entity_type, id, properties);
        debug!(entity_type, id, "entity created");

        let entity = self.lookup(entity_type, id);
        Ok(Some(success_response(json!({"entity": entity}))))
    }

    async fn get(self: Arc<Self>, data: Value, _ctx: EventContext) -> HandlerResult {
        let entity_type = data.get("type").and_then(Value::as_str).unwrap_or_default();
        let id = data.get("id").and_then(Value::as_str).unwrap_or_default();

        match self.lookup(entity_type, id) {
            Some(entity) => Ok(Some(success_response(json!({"entity": entity})))),
            None => Ok(Some(error_response(
                "Entity not found",
                Some(json!({"type": entity_type, "id": id})),
            ))),
        }
    }

    async fn update(self: Arc<Self>, data: Value, _ctx: EventContext) -> HandlerResult {
        let entity_type = data.get("type").and_then(Value::as_str).unwrap_or_default();
        let id = data.get("id").and_then(Value::as_str).unwrap_or_default();
        let Some(updates) = data.get("properties").and_then(Value::as_object) else {
            return Ok(Some(error_response("Missing properties", None)));
        };

        let mut entities = self.entities.lock();
        let Some(entity) = entities.get_mut(&key(entity_type, id)) else {
            return Ok(Some(error_response(
                "Entity not found",
                Some(json!({"type": entity_type, "id": id})),
            )));
        };

        let mut merged = match &entity.properties {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for (k, v) in updates {
            merged.insert(k.clone(), v.clone());
        }
        entity.properties = Value::Object(merged);
        entity.updated_at = self.clock.timestamp();
        let entity = entity.clone();
        drop(entities);

        Ok(Some(success_response(json!({"entity": entity}))))
    }

    async fn delete(self: Arc<Self>, data: Value, ctx: EventContext) -> HandlerResult {
        let entity_type = data
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let removed = self.entities.lock().remove(&key(&entity_type, &id));
        let Some(removed) = removed else {
            return Ok(Some(error_response(
                "Entity not found",
                Some(json!({"type": entity_type, "id": id})),
            )));
        };

        // Deletion notification drives parent-scope rule cleanup.
        let _ = ctx
            .emit("state:entity:deleted", json!({"type": entity_type, "id": id}))
            .await;

        Ok(Some(success_response(json!({"entity": removed, "status": "deleted"}))))
    }

    async fn query(self: Arc<Self>, data: Value, _ctx: EventContext) -> HandlerResult {
        let entity_type = data.get("type").and_then(Value::as_str);
        let where_clause = data.get("where").and_then(Value::as_object);

        let entities = self.entities.lock();
        let matched: Vec<Entity> = entities
            .values()
            .filter(|e| entity_type.is_none_or(|t| e.entity_type == t))
            .filter(|e| {
                where_clause.is_none_or(|clauses| {
                    clauses.iter().all(|(path, expected)| {
                        entity_field(e, path).as_ref() == Some(expected)
                    })
                })
            })
            .cloned()
            .collect();

        Ok(Some(success_response(json!({
            "entities": matched,
            "count": matched.len(),
        }))))
    }

    /// Contribute agent and identity entities to checkpoints.
    async fn checkpoint_collect(self: Arc<Self>, _data: Value, _ctx: EventContext) -> HandlerResult {
        let entities = self.entities.lock();
        let mut agents = Map::new();
        let mut identities = Map::new();
        for entity in entities.values() {
            match entity.entity_type.as_str() {
                "agent" => {
                    agents.insert(entity.id.clone(), entity.properties.clone());
                }
                "identity" => {
                    identities.insert(entity.id.clone(), entity.properties.clone());
                }
                _ => {}
            }
        }

        Ok(Some(json!({
            "agents": agents,
            "identities": identities,
        })))
    }
}

/// Look up a dotted path on an entity: `properties.x.y` or a top-level
/// field.
fn entity_field(entity: &Entity, path: &str) -> Option<Value> {
    let value = serde_json::to_value(entity).ok()?;
    let mut current = &value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
