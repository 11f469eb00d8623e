// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transformer definitions.
//!
//! A transformer is a declarative rewrite: when an event matching `source`
//! is emitted and `condition` holds, `target` is re-emitted with the
//! resolved `mapping`. `foreach` expands over a list in the event data;
//! `async` schedules the re-emit as its own task instead of inline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Event pattern to match; `*` alone matches every event.
    pub source: String,

    /// Event name to re-emit.
    pub target: String,

    /// Condition expression; absent means always.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Mapping tree resolved by the template engine. Absent means the
    /// original data passes through unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Value>,

    /// Schedule the re-emit as a detached task.
    #[serde(rename = "async", default, skip_serializing_if = "is_false")]
    pub is_async: bool,

    /// Path to a list in the event data; the target is emitted once per
    /// element with `{$, item, index}` in scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<String>,

    /// Metadata describing where a terminal response is expected to be
    /// routed. The runtime records it but does not correlate replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_route: Option<Value>,
}

impl TransformerDef {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: None,
            source: source.into(),
            target: target.into(),
            condition: None,
            mapping: None,
            is_async: false,
            foreach: None,
            response_route: None,
        }
    }

    pub fn with_mapping(mut self, mapping: Value) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_foreach(mut self, path: impl Into<String>) -> Self {
        self.foreach = Some(path.into());
        self
    }

    pub fn into_async(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Display name for logs: explicit name, else `source -> target`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{} -> {}", self.source, self.target),
        }
    }
}

#[cfg(test)]
#[path = "definition_tests.rs"]
mod tests;
