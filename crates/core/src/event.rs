// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event envelope: the logged form of one emission.

use crate::context::ContextRecord;
use crate::id::{ContextRef, EventId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single emission as it appears in the reference event log.
///
/// `event_name` is a colon-delimited namespace path (`agent:spawn`);
/// `data` is an arbitrary JSON object; the full context is reachable
/// through `context_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,
    pub event_name: String,
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(default)]
    pub data: Value,
    pub context_ref: ContextRef,
}

impl EventEnvelope {
    /// Build the envelope for an emission from its freshly created context.
    pub fn from_context(event_name: impl Into<String>, data: Value, context: &ContextRecord) -> Self {
        Self {
            event_id: context.event_id.clone(),
            event_name: event_name.into(),
            timestamp: context.event_timestamp,
            data,
            context_ref: context.reference.clone(),
        }
    }

    /// Leading namespace segment of the event name (`agent` for
    /// `agent:spawn`). The whole name when there is no colon.
    pub fn namespace(&self) -> &str {
        self.event_name
            .split_once(':')
            .map_or(self.event_name.as_str(), |(ns, _)| ns)
    }

    pub fn log_summary(&self) -> String {
        format!("{} id={}", self.event_name, self.event_id)
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
