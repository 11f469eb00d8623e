// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Context manager: hot in-memory storage plus SQLite cold storage.
//!
//! Hot storage is an insertion-ordered LRU holding the last day of
//! emissions with inverted indexes by ref, correlation, agent, and
//! parent→children chains. The single lock is held only for O(1) index
//! updates; cold persistence goes through the storage writer queue.
//!
//! Python's contextvars-based ambient context is replaced by explicit
//! parent threading: `create` takes the parent record and the inheritance
//! rules live on [`ContextRecord`].

use indexmap::IndexMap;
use ksi_core::{Clock, ContextOverrides, ContextRecord, EventEnvelope, IdGen};
use ksi_storage::ContextDb;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Hot storage caps from the original runtime: 1M entries, 24h TTL.
const MAX_HOT_EVENTS: usize = 1_000_000;
const HOT_TTL_SECS: f64 = 24.0 * 3600.0;

/// One emission held in hot storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotRecord {
    pub envelope: EventEnvelope,
    pub context: ContextRecord,
    pub added_at: f64,
}

#[derive(Default)]
struct HotStore {
    events: IndexMap<String, HotRecord>,
    by_ref: HashMap<String, ContextRecord>,
    by_correlation: HashMap<String, Vec<String>>,
    by_agent: HashMap<String, Vec<String>>,
    children: HashMap<String, Vec<String>>,
}

impl HotStore {
    fn add(&mut self, record: HotRecord) {
        let event_id = record.envelope.event_id.as_str().to_string();
        let context = &record.context;

        self.by_ref
            .insert(context.reference.as_str().to_string(), context.clone());
        self.by_correlation
            .entry(context.correlation_id.as_str().to_string())
            .or_default()
            .push(event_id.clone());
        if let Some(agent_id) = &context.agent_id {
            self.by_agent
                .entry(agent_id.as_str().to_string())
                .or_default()
                .push(event_id.clone());
        }
        if let Some(parent) = &context.parent_event_id {
            self.children
                .entry(parent.as_str().to_string())
                .or_default()
                .push(event_id.clone());
        }
        self.events.insert(event_id, record);

        while self.events.len() > MAX_HOT_EVENTS {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        let Some((event_id, record)) = self.events.shift_remove_index(0) else {
            return;
        };
        self.unindex(&event_id, &record.context);
    }

    fn unindex(&mut self, event_id: &str, context: &ContextRecord) {
        self.by_ref.remove(context.reference.as_str());

        let corr = context.correlation_id.as_str();
        if let Some(ids) = self.by_correlation.get_mut(corr) {
            ids.retain(|id| id != event_id);
            if ids.is_empty() {
                self.by_correlation.remove(corr);
            }
        }
        if let Some(agent_id) = &context.agent_id {
            if let Some(ids) = self.by_agent.get_mut(agent_id.as_str()) {
                ids.retain(|id| id != event_id);
                if ids.is_empty() {
                    self.by_agent.remove(agent_id.as_str());
                }
            }
        }
        if let Some(parent) = &context.parent_event_id {
            if let Some(ids) = self.children.get_mut(parent.as_str()) {
                ids.retain(|id| id != event_id);
                if ids.is_empty() {
                    self.children.remove(parent.as_str());
                }
            }
        }
    }

    fn age_out(&mut self, cutoff: f64) -> usize {
        let expired: Vec<String> = self
            .events
            .iter()
            .take_while(|(_, record)| record.added_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for event_id in &expired {
            if let Some(record) = self.events.shift_remove(event_id) {
                self.unindex(event_id, &record.context);
            }
        }
        expired.len()
    }
}

/// Serializable snapshot of hot storage for the checkpoint engine.
///
/// Only the records are stored; the inverted indexes rehydrate
/// deterministically on restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotSnapshot {
    pub events: Vec<HotRecord>,
}

/// Counters describing the hot store.
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub hot_count: usize,
    pub correlation_chains: usize,
    pub agent_contexts: usize,
    pub event_chains: usize,
}

/// Coordinates hot and cold context storage and allocates contexts.
pub struct ContextManager {
    hot: Mutex<HotStore>,
    cold: Option<ContextDb>,
    idgen: Arc<dyn IdGen>,
    clock: Arc<dyn Clock>,
}

impl ContextManager {
    pub fn new(idgen: Arc<dyn IdGen>, clock: Arc<dyn Clock>, cold: Option<ContextDb>) -> Self {
        Self {
            hot: Mutex::new(HotStore::default()),
            cold,
            idgen,
            clock,
        }
    }

    /// Allocate the context for a new emission.
    ///
    /// With a parent, chain identity (correlation, root, depth) is
    /// inherited; without one a fresh correlation id is generated.
    pub fn create(
        &self,
        parent: Option<&ContextRecord>,
        overrides: ContextOverrides,
    ) -> ContextRecord {
        let event_id = self.idgen.event_id();
        let timestamp = self.clock.timestamp();
        match parent {
            Some(parent) => ContextRecord::child(parent, event_id, timestamp, overrides),
            None => {
                let correlation = self.idgen.correlation_id();
                ContextRecord::root(event_id, timestamp, correlation, overrides)
            }
        }
    }

    /// Store an emission: hot synchronously, cold through the writer
    /// queue.
    pub async fn store(&self, envelope: &EventEnvelope, context: &ContextRecord) {
        {
            let mut hot = self.hot.lock();
            hot.add(HotRecord {
                envelope: envelope.clone(),
                context: context.clone(),
                added_at: self.clock.timestamp(),
            });
        }

        if let Some(cold) = &self.cold {
            let created_at = self.clock.epoch_ms() as i64 / 1000;
            if let Err(e) = cold.store(context, created_at).await {
                warn!(reference = %context.reference, error = %e, "cold context store failed");
            }
        }
    }

    /// Resolve a `ctx_*` reference: hot first, then cold.
    pub async fn resolve(&self, reference: &str) -> Option<ContextRecord> {
        if let Some(found) = self.hot.lock().by_ref.get(reference).cloned() {
            return Some(found);
        }
        match &self.cold {
            Some(cold) => cold.get(reference).await.ok().flatten(),
            None => None,
        }
    }

    /// Fetch a hot record by event id.
    pub fn get_hot(&self, event_id: &str) -> Option<HotRecord> {
        self.hot.lock().events.get(event_id).cloned()
    }

    /// All hot records in a correlation, insertion order.
    pub fn by_correlation(&self, correlation_id: &str) -> Vec<HotRecord> {
        let hot = self.hot.lock();
        hot.by_correlation
            .get(correlation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| hot.events.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All hot records attributed to an agent.
    pub fn by_agent(&self, agent_id: &str) -> Vec<HotRecord> {
        let hot = self.hot.lock();
        hot.by_agent
            .get(agent_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| hot.events.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First hot record with the given event name (insertion order).
    pub fn find_by_name(&self, event_name: &str) -> Option<HotRecord> {
        let hot = self.hot.lock();
        hot.events
            .values()
            .find(|r| r.envelope.event_name == event_name)
            .cloned()
    }

    /// Direct children of an event in the emission tree.
    pub fn children_of(&self, event_id: &str) -> Vec<String> {
        self.hot
            .lock()
            .children
            .get(event_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Event plus all descendants, breadth-first.
    pub fn chain_from(&self, event_id: &str) -> Vec<HotRecord> {
        let hot = self.hot.lock();
        let mut chain = Vec::new();
        let mut queue = std::collections::VecDeque::from([event_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            if let Some(record) = hot.events.get(&current) {
                chain.push(record.clone());
            }
            if let Some(children) = hot.children.get(&current) {
                queue.extend(children.iter().cloned());
            }
        }
        chain
    }

    /// Snapshot hot storage for checkpointing.
    pub fn snapshot(&self) -> HotSnapshot {
        let hot = self.hot.lock();
        HotSnapshot {
            events: hot.events.values().cloned().collect(),
        }
    }

    /// Clear indexes and rehydrate deterministically from a snapshot.
    pub fn restore(&self, snapshot: HotSnapshot) -> usize {
        let mut hot = self.hot.lock();
        *hot = HotStore::default();
        let count = snapshot.events.len();
        for record in snapshot.events {
            hot.add(record);
        }
        info!(events = count, "restored hot context storage");
        count
    }

    /// Remove hot records older than the TTL. Returns how many aged out.
    pub fn age_out(&self) -> usize {
        let cutoff = self.clock.timestamp() - HOT_TTL_SECS;
        let removed = self.hot.lock().age_out(cutoff);
        if removed > 0 {
            info!(removed, "aged out hot contexts");
        }
        removed
    }

    /// Sweep expired cold rows and old event index entries.
    pub async fn sweep_cold(&self) -> u64 {
        let Some(cold) = &self.cold else {
            return 0;
        };
        let now = self.clock.epoch_ms() as i64 / 1000;
        match cold.sweep_expired(now).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "cold context sweep failed");
                0
            }
        }
    }

    pub fn stats(&self) -> ContextStats {
        let hot = self.hot.lock();
        ContextStats {
            hot_count: hot.events.len(),
            correlation_chains: hot.by_correlation.len(),
            agent_contexts: hot.by_agent.len(),
            event_chains: hot.children.len(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn idgen(&self) -> &Arc<dyn IdGen> {
        &self.idgen
    }

    pub async fn flush_cold(&self) {
        if let Some(cold) = &self.cold {
            if let Err(e) = cold.flush().await {
                warn!(error = %e, "cold context flush failed");
            }
        }
    }
}

/// Event surface over the context manager.
pub struct ContextService;

impl ContextService {
    pub fn register(router: &crate::router::EventRouter) {
        use crate::handler::{handler_fn, priority};
        use crate::response::{error_response, success_response};
        use serde_json::{json, Value};

        let handle = router.handle();
        router.register_handler(
            "context",
            "context:resolve",
            priority::NORMAL,
            handler_fn(move |data: Value, _ctx| {
                let handle = handle.clone();
                async move {
                    let Some(reference) = data.get("ref").and_then(Value::as_str) else {
                        return Ok(Some(error_response("Missing ref", None)));
                    };
                    let contexts = handle
                        .contexts()
                        .map_err(|e| crate::handler::HandlerError::service(e.to_string()))?;
                    match contexts.resolve(reference).await {
                        Some(context) => {
                            Ok(Some(success_response(json!({"context": context.to_value()}))))
                        }
                        None => Ok(Some(error_response(
                            "Context not found",
                            Some(json!({"ref": reference})),
                        ))),
                    }
                }
            }),
        );

        let handle = router.handle();
        router.register_handler(
            "context",
            "context:stats",
            priority::NORMAL,
            handler_fn(move |_data, _ctx| {
                let handle = handle.clone();
                async move {
                    let contexts = handle
                        .contexts()
                        .map_err(|e| crate::handler::HandlerError::service(e.to_string()))?;
                    Ok(Some(success_response(
                        serde_json::to_value(contexts.stats()).unwrap_or(serde_json::Value::Null),
                    )))
                }
            }),
        );
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
