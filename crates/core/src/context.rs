// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Immutable context records attached to every event emission.
//!
//! A context identifies one emission and links it into a tree via
//! parent/root ids and a correlation id. Contexts are passed by reference
//! (`ctx_<event_id>`) wherever practical; the record itself lives in hot
//! storage and, eventually, in SQLite cold storage. A context is never
//! mutated after it is stored; derived emissions allocate a child.

use crate::id::{AgentId, ClientId, ContextRef, CorrelationId, EventId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller-supplied fields merged into a freshly created context.
///
/// Transports attach `_client_id`, services attach `_agent_id` or
/// `_session`; anything else lands in `extra` and is inherited by child
/// contexts until overridden.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextOverrides {
    pub agent_id: Option<AgentId>,
    pub client_id: Option<ClientId>,
    pub session: Option<Value>,
    pub correlation_id: Option<CorrelationId>,
    pub extra: Map<String, Value>,
}

impl ContextOverrides {
    pub fn is_empty(&self) -> bool {
        self.agent_id.is_none()
            && self.client_id.is_none()
            && self.session.is_none()
            && self.correlation_id.is_none()
            && self.extra.is_empty()
    }

    /// Parse overrides out of a `_ksi_context` object supplied on the wire.
    ///
    /// Known system fields map onto typed members; any other
    /// underscore-prefixed key is kept as an inherited extra.
    pub fn from_wire(value: &Value) -> Self {
        let mut overrides = Self::default();
        let Some(map) = value.as_object() else {
            return overrides;
        };
        for (key, val) in map {
            match key.as_str() {
                "_agent_id" => {
                    overrides.agent_id = val.as_str().map(AgentId::new);
                }
                "_client_id" => {
                    overrides.client_id = val.as_str().map(ClientId::new);
                }
                "_session" => overrides.session = Some(val.clone()),
                "_correlation_id" => {
                    overrides.correlation_id = val.as_str().map(CorrelationId::new);
                }
                k if k.starts_with('_') => {
                    overrides.extra.insert(key.clone(), val.clone());
                }
                _ => {}
            }
        }
        overrides
    }
}

/// Immutable record identifying one event emission.
///
/// Serializes to the underscore-prefixed wire form (`_event_id`, `_ref`,
/// ...) used inside `_ksi_context` payloads and SQLite `context_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    #[serde(rename = "_event_id")]
    pub event_id: EventId,

    /// Wall-clock seconds since the Unix epoch.
    #[serde(rename = "_event_timestamp")]
    pub event_timestamp: f64,

    #[serde(rename = "_correlation_id")]
    pub correlation_id: CorrelationId,

    /// Stable handle `ctx_<event_id>`.
    #[serde(rename = "_ref")]
    pub reference: ContextRef,

    /// 0 at the root of a chain.
    #[serde(rename = "_event_depth")]
    pub event_depth: u32,

    #[serde(
        rename = "_parent_event_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_event_id: Option<EventId>,

    /// Equals `event_id` when the context has no parent.
    #[serde(rename = "_root_event_id")]
    pub root_event_id: EventId,

    #[serde(rename = "_agent_id", default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,

    #[serde(rename = "_client_id", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,

    #[serde(rename = "_session", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Value>,

    /// Caller-supplied `_x` fields, inherited from the parent unless
    /// overridden.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContextRecord {
    /// Create a root context (depth 0, root id = event id).
    pub fn root(
        event_id: EventId,
        timestamp: f64,
        correlation_id: CorrelationId,
        overrides: ContextOverrides,
    ) -> Self {
        let reference = ContextRef::for_event(&event_id);
        Self {
            root_event_id: event_id.clone(),
            event_id,
            event_timestamp: timestamp,
            correlation_id: overrides.correlation_id.unwrap_or(correlation_id),
            reference,
            event_depth: 0,
            parent_event_id: None,
            agent_id: overrides.agent_id,
            client_id: overrides.client_id,
            session: overrides.session,
            extra: overrides.extra,
        }
    }

    /// Create a child context inheriting chain identity from `parent`.
    ///
    /// Depth is parent + 1, root id is stable across the chain, correlation
    /// is inherited unless explicitly overridden, and parent extras carry
    /// forward with override extras winning on key collision.
    pub fn child(parent: &Self, event_id: EventId, timestamp: f64, overrides: ContextOverrides) -> Self {
        let mut extra = parent.extra.clone();
        for (k, v) in overrides.extra {
            extra.insert(k, v);
        }
        let reference = ContextRef::for_event(&event_id);
        Self {
            root_event_id: parent.root_event_id.clone(),
            parent_event_id: Some(parent.event_id.clone()),
            event_depth: parent.event_depth + 1,
            correlation_id: overrides
                .correlation_id
                .unwrap_or_else(|| parent.correlation_id.clone()),
            event_id,
            event_timestamp: timestamp,
            reference,
            agent_id: overrides.agent_id.or_else(|| parent.agent_id.clone()),
            client_id: overrides.client_id.or_else(|| parent.client_id.clone()),
            session: overrides.session.or_else(|| parent.session.clone()),
            extra,
        }
    }

    /// Session id string extracted from the `_session` object, if any.
    pub fn session_id(&self) -> Option<&str> {
        match &self.session {
            Some(Value::Object(map)) => map.get("id").and_then(Value::as_str),
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// The context as a generic JSON object (wire form).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
