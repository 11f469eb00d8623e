// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The event router.
//!
//! `emit` assigns a context, appends the emission to the reference event
//! log, applies matching transformers (before handlers, recording a
//! routing decision), then invokes all matching handlers concurrently and
//! collects their results. Handler failures become `system:error`
//! emissions and are excluded from the result list.
//!
//! Recursive emits thread the parent context explicitly; depth is bounded
//! by [`MAX_EMIT_DEPTH`].

use crate::context::ContextManager;
use crate::handler::{EventContext, EventHandler, HandlerMeta, RegisteredHandler};
use crate::introspection::RoutingDecision;
use crate::transformer::{CompiledTransformer, SourceGuard, TransformerTable};
use futures_util::future::{join_all, BoxFuture};
use ksi_core::{
    matches_pattern, pattern::is_pattern, Clock, ContextOverrides, ContextRecord, EventEnvelope,
    IdGen, RuleId,
};
use ksi_storage::{ContextDb, EventLog};
use ksi_transform::{evaluate_condition, template, TransformerDef};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Recursion bound for emits triggered from handlers and transformers.
pub const MAX_EMIT_DEPTH: u32 = 64;

/// Routing decisions kept for introspection.
const DECISION_RING: usize = 1000;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("emit depth exceeded for {event} (max {max})")]
    DepthExceeded { event: String, max: u32 },

    #[error("router has shut down")]
    Closed,

    #[error("timeout waiting for {event}")]
    Timeout { event: String },
}

/// Options for one emission.
#[derive(Clone, Default)]
pub struct EmitOptions {
    /// Parent context; chain identity is inherited from it.
    pub parent: Option<ContextRecord>,
    /// Fields merged into the new context (`_agent_id`, `_client_id`, ...).
    pub overrides: ContextOverrides,
}

impl EmitOptions {
    pub fn child_of(parent: &ContextRecord) -> Self {
        Self {
            parent: Some(parent.clone()),
            overrides: ContextOverrides::default(),
        }
    }

    pub fn with_overrides(overrides: ContextOverrides) -> Self {
        Self {
            parent: None,
            overrides,
        }
    }
}

/// Construction-time wiring for a router.
pub struct RouterConfig {
    pub idgen: Arc<dyn IdGen>,
    pub clock: Arc<dyn Clock>,
    pub cold_contexts: Option<ContextDb>,
    pub event_log: Option<EventLog>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            idgen: Arc::new(ksi_core::UuidIdGen),
            clock: Arc::new(ksi_core::SystemClock),
            cold_contexts: None,
            event_log: None,
        }
    }
}

pub(crate) struct RouterInner {
    handlers: RwLock<HashMap<String, Vec<Arc<RegisteredHandler>>>>,
    pattern_handlers: RwLock<Vec<(String, Arc<RegisteredHandler>)>>,
    /// Immutable snapshot, swapped on write; the emit path clones the Arc.
    transformers: RwLock<Arc<TransformerTable>>,
    contexts: Arc<ContextManager>,
    event_log: Option<EventLog>,
    decisions: Mutex<VecDeque<RoutingDecision>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown_acks: Mutex<HashSet<String>>,
    shutting_down: AtomicBool,
    ack_notify: Notify,
    idgen: Arc<dyn IdGen>,
    clock: Arc<dyn Clock>,
    emitted: AtomicU64,
}

/// The event router. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

/// Weak handle to the router, safe to hold from handlers and services
/// without keeping the router alive.
#[derive(Clone)]
pub struct RouterHandle {
    inner: Weak<RouterInner>,
}

impl EventRouter {
    pub fn new(config: RouterConfig) -> Self {
        let contexts = Arc::new(ContextManager::new(
            config.idgen.clone(),
            config.clock.clone(),
            config.cold_contexts,
        ));

        let router = Self {
            inner: Arc::new(RouterInner {
                handlers: RwLock::new(HashMap::new()),
                pattern_handlers: RwLock::new(Vec::new()),
                transformers: RwLock::new(Arc::new(TransformerTable::default())),
                contexts,
                event_log: config.event_log,
                decisions: Mutex::new(VecDeque::with_capacity(DECISION_RING)),
                tasks: Mutex::new(HashMap::new()),
                shutdown_acks: Mutex::new(HashSet::new()),
                shutting_down: AtomicBool::new(false),
                ack_notify: Notify::new(),
                idgen: config.idgen,
                clock: config.clock,
                emitted: AtomicU64::new(0),
            }),
        };

        // The router consumes shutdown acknowledgments itself.
        let inner = Arc::downgrade(&router.inner);
        router.register_handler(
            "router",
            "shutdown:acknowledge",
            crate::handler::priority::HIGHEST,
            crate::handler::handler_fn(move |data: Value, _ctx| {
                let inner = inner.clone();
                async move {
                    if let Some(inner) = inner.upgrade() {
                        if let Some(service) = data.get("service").and_then(Value::as_str) {
                            inner.shutdown_acks.lock().insert(service.to_string());
                            inner.ack_notify.notify_waiters();
                            debug!(service, "shutdown acknowledged");
                        }
                    }
                    Ok(None)
                }
            }),
        );

        router
    }

    pub fn handle(&self) -> RouterHandle {
        RouterHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register a handler record. Direct registrations keep their list
    /// sorted by priority; wildcard sources go to the pattern list.
    pub fn register_handler(
        &self,
        module: &str,
        event: &str,
        priority: i32,
        handler: Arc<dyn EventHandler>,
    ) {
        let registered = Arc::new(RegisteredHandler {
            module: module.to_string(),
            event: event.to_string(),
            priority,
            handler,
        });

        if is_pattern(event) {
            self.inner
                .pattern_handlers
                .write()
                .push((event.to_string(), registered));
        } else {
            let mut handlers = self.inner.handlers.write();
            let list = handlers.entry(event.to_string()).or_default();
            list.push(registered);
            list.sort_by_key(|h| h.priority);
        }
        debug!(module, event, priority, "registered handler");
    }

    /// Register a transformer. Rule-backed transformers carry their rule
    /// id for introspection and later teardown.
    pub fn register_transformer(
        &self,
        def: TransformerDef,
        rule_id: Option<RuleId>,
        priority: i64,
        guard: Option<SourceGuard>,
    ) {
        let label = def.label();
        let mut table = self.inner.transformers.write();
        *table = Arc::new(table.with_added(CompiledTransformer {
            def,
            rule_id,
            priority,
            guard,
        }));
        debug!(transformer = %label, "registered transformer");
    }

    /// Remove all transformers created by a routing rule.
    pub fn unregister_rule_transformers(&self, rule_id: &RuleId) {
        let mut table = self.inner.transformers.write();
        *table = Arc::new(table.without_rule(rule_id));
    }

    /// Remove statically registered transformers for a source.
    pub fn unregister_source_transformers(&self, source: &str) {
        let mut table = self.inner.transformers.write();
        *table = Arc::new(table.without_source(source));
    }

    pub async fn emit(&self, event: &str, data: Value) -> Result<Vec<Value>, RouterError> {
        self.emit_with(event, data, EmitOptions::default()).await
    }

    pub async fn emit_with(
        &self,
        event: &str,
        data: Value,
        opts: EmitOptions,
    ) -> Result<Vec<Value>, RouterError> {
        self.inner
            .clone()
            .emit_boxed(event.to_string(), data, opts)
            .await
    }

    /// Emit and return the first non-`None` result.
    pub async fn emit_first(
        &self,
        event: &str,
        data: Value,
        opts: EmitOptions,
    ) -> Result<Option<Value>, RouterError> {
        let results = self.emit_with(event, data, opts).await?;
        Ok(results.into_iter().next())
    }

    /// `emit_first` with a per-call timeout, used by transport
    /// request/response paths.
    pub async fn emit_first_timeout(
        &self,
        event: &str,
        data: Value,
        opts: EmitOptions,
        timeout: Duration,
    ) -> Result<Option<Value>, RouterError> {
        match tokio::time::timeout(timeout, self.emit_with(event, data, opts)).await {
            Ok(result) => Ok(result?.into_iter().next()),
            Err(_) => Err(RouterError::Timeout {
                event: event.to_string(),
            }),
        }
    }

    pub fn contexts(&self) -> Arc<ContextManager> {
        self.inner.contexts.clone()
    }

    pub fn event_log(&self) -> Option<EventLog> {
        self.inner.event_log.clone()
    }

    /// Snapshot of recent routing decisions, newest last.
    pub fn decisions(&self) -> Vec<RoutingDecision> {
        self.inner.decisions.lock().iter().cloned().collect()
    }

    /// Handler catalog for `module:*` queries.
    pub fn handler_catalog(&self) -> Vec<HandlerMeta> {
        let mut out: Vec<HandlerMeta> = self
            .inner
            .handlers
            .read()
            .values()
            .flatten()
            .map(|h| HandlerMeta {
                module: h.module.clone(),
                event: h.event.clone(),
                priority: h.priority,
            })
            .collect();
        out.extend(self.inner.pattern_handlers.read().iter().map(|(_, h)| HandlerMeta {
            module: h.module.clone(),
            event: h.event.clone(),
            priority: h.priority,
        }));
        out.sort_by(|a, b| (&a.module, &a.event).cmp(&(&b.module, &b.event)));
        out
    }

    pub fn transformer_count(&self) -> usize {
        self.inner.transformers.read().len()
    }

    pub fn events_emitted(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    /// Start a supervised background task. Failures emit `task:error`;
    /// restart is the owning module's responsibility.
    pub fn start_task<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        let mut tasks = self.inner.tasks.lock();
        if tasks.contains_key(name) {
            warn!(task = name, "task already running");
            return;
        }

        let handle = self.handle();
        let task_name = name.to_string();
        let join = tokio::spawn(async move {
            match future.await {
                Ok(()) => debug!(task = %task_name, "task finished"),
                Err(e) => {
                    error!(task = %task_name, error = %e, "task failed");
                    let _ = handle
                        .emit("task:error", json!({"task": task_name, "error": e}))
                        .await;
                }
            }
        });
        tasks.insert(name.to_string(), join);
        info!(task = name, "started background task");
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tasks.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stop_task(&self, name: &str) {
        if let Some(join) = self.inner.tasks.lock().remove(name) {
            join.abort();
            info!(task = name, "stopped background task");
        }
    }

    pub fn stop_all_tasks(&self) {
        let mut tasks = self.inner.tasks.lock();
        for (name, join) in tasks.drain() {
            join.abort();
            debug!(task = %name, "aborted background task");
        }
    }

    /// Flip into shutdown mode and clear acknowledgments.
    pub fn begin_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.shutdown_acks.lock().clear();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Wait (bounded) until every listed critical service has emitted
    /// `shutdown:acknowledge`. Returns false on deadline.
    pub async fn wait_for_shutdown_acks(&self, services: &[String], timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let acks = self.inner.shutdown_acks.lock();
                if services.iter().all(|s| acks.contains(s)) {
                    return true;
                }
            }
            let notified = self.inner.ack_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let acks = self.inner.shutdown_acks.lock();
                let missing: Vec<&String> =
                    services.iter().filter(|s| !acks.contains(*s)).collect();
                warn!(?missing, "shutdown acknowledgment deadline reached");
                return false;
            }
        }
    }
}

impl RouterInner {
    fn emit_boxed(
        self: Arc<Self>,
        event: String,
        data: Value,
        opts: EmitOptions,
    ) -> BoxFuture<'static, Result<Vec<Value>, RouterError>> {
        Box::pin(async move { self.emit_impl(event, data, opts).await })
    }

    async fn emit_impl(
        self: Arc<Self>,
        event: String,
        data: Value,
        opts: EmitOptions,
    ) -> Result<Vec<Value>, RouterError> {
        // Depth guard bounds handler/transformer recursion.
        if let Some(parent) = &opts.parent {
            if parent.event_depth + 1 > MAX_EMIT_DEPTH {
                return Err(RouterError::DepthExceeded {
                    event,
                    max: MAX_EMIT_DEPTH,
                });
            }
        }

        let context = self
            .contexts
            .create(opts.parent.as_ref(), opts.overrides);
        let envelope = EventEnvelope::from_context(&event, data.clone(), &context);
        self.emitted.fetch_add(1, Ordering::Relaxed);

        self.contexts.store(&envelope, &context).await;
        if let Some(log) = &self.event_log {
            if let Err(e) = log.append(&envelope, &context).await {
                warn!(event = %event, error = %e, "event log append failed");
            }
        }

        self.apply_transformers(&event, &data, &context).await;

        let handlers = self.matching_handlers(&event);
        if handlers.is_empty() {
            return Ok(Vec::new());
        }

        let handle = RouterHandle {
            inner: Arc::downgrade(&self),
        };
        let futures = handlers.iter().map(|registered| {
            // Each handler gets its own copy of the data; callers treat
            // it as read-only and this enforces it.
            let ctx = EventContext {
                event: event.clone(),
                context: context.clone(),
                handle: handle.clone(),
            };
            registered.handler.handle(data.clone(), ctx)
        });

        let outcomes = join_all(futures).await;

        let mut results = Vec::new();
        for (registered, outcome) in handlers.iter().zip(outcomes) {
            match outcome {
                Ok(Some(value)) => results.push(value),
                Ok(None) => {}
                Err(e) => {
                    error!(
                        event = %event,
                        module = %registered.module,
                        error = %e,
                        "handler failed"
                    );
                    self.clone()
                        .emit_handler_error(&event, &registered.module, &e, &data, &context);
                }
            }
        }

        Ok(results)
    }

    fn matching_handlers(&self, event: &str) -> Vec<Arc<RegisteredHandler>> {
        let mut matched: Vec<Arc<RegisteredHandler>> = self
            .handlers
            .read()
            .get(event)
            .map(|list| list.to_vec())
            .unwrap_or_default();
        for (pattern, handler) in self.pattern_handlers.read().iter() {
            if matches_pattern(event, pattern) {
                matched.push(Arc::clone(handler));
            }
        }
        matched.sort_by_key(|h| h.priority);
        matched
    }

    /// Convert a handler failure into a `system:error` emission. Errors
    /// raised while handling `system:error` itself are only logged.
    fn emit_handler_error(
        self: Arc<Self>,
        event: &str,
        module: &str,
        error: &crate::handler::HandlerError,
        data: &Value,
        context: &ContextRecord,
    ) {
        if event == "system:error" {
            error!(module, error = %error, "error handler failed; not re-emitting");
            return;
        }

        let payload = json!({
            "error_type": error.kind.as_str(),
            "error_class": "HandlerError",
            "error_message": error.message.clone(),
            "source": {
                "operation": event,
                "module": module,
                "operation_type": "handler",
            },
            "original_data": data,
            "_ksi_context": context.to_value(),
        });

        let opts = EmitOptions::child_of(context);
        tokio::spawn(async move {
            if let Err(e) = self.emit_boxed("system:error".to_string(), payload, opts).await {
                error!(error = %e, "failed to emit system:error");
            }
        });
    }

    /// Apply matching transformers, recording one routing decision per
    /// emission that evaluated at least one transformer.
    async fn apply_transformers(self: &Arc<Self>, event: &str, data: &Value, context: &ContextRecord) {
        let table = self.transformers.read().clone();
        let matching = table.matching(event);
        if matching.is_empty() {
            return;
        }

        // Templates and conditions see the event name as a context field.
        let mut context_value = context.to_value();
        if let Some(map) = context_value.as_object_mut() {
            map.insert("_event_name".to_string(), Value::String(event.to_string()));
        }
        let mut decision = RoutingDecision {
            decision_id: self.idgen.next_with_prefix("dec"),
            event_id: context.event_id.as_str().to_string(),
            event_name: event.to_string(),
            rules_evaluated: Vec::new(),
            rules_matched: Vec::new(),
            rule_applied: None,
            transformation_applied: false,
            timestamp: self.clock.timestamp(),
        };

        for transformer in matching {
            let label = transformer.label();
            decision.rules_evaluated.push(label.clone());

            if let Some(condition) = &transformer.def.condition {
                match evaluate_condition(condition, data, &context_value) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(
                            transformer = %label,
                            error = %e,
                            "condition evaluation failed; skipping transformer"
                        );
                        continue;
                    }
                }
            }

            decision.rules_matched.push(label.clone());
            if decision.rule_applied.is_none() {
                // Highest priority matched rule wins the decision record.
                decision.rule_applied = Some(label.clone());
            }
            decision.transformation_applied = true;

            self.run_transformer(&transformer, data, context, &context_value)
                .await;
        }

        let mut decisions = self.decisions.lock();
        if decisions.len() >= DECISION_RING {
            decisions.pop_front();
        }
        decisions.push_back(decision);
    }

    async fn run_transformer(
        self: &Arc<Self>,
        transformer: &CompiledTransformer,
        data: &Value,
        context: &ContextRecord,
        context_value: &Value,
    ) {
        let def = &transformer.def;

        if let Some(foreach_path) = &def.foreach {
            // `foreach: data.items` names the list under a `data.` head;
            // a bare head is also accepted.
            let root = json!({ "data": data });
            let list = template::resolve_path(foreach_path, &root, context_value)
                .or_else(|| template::resolve_path(foreach_path, data, context_value));
            let Some(Value::Array(items)) = list else {
                warn!(
                    transformer = %def.label(),
                    path = %foreach_path,
                    "foreach path did not resolve to a list"
                );
                return;
            };

            for (index, item) in items.iter().enumerate() {
                let resolved = match &def.mapping {
                    Some(mapping) => {
                        template::resolve_foreach(mapping, data, item, index, context_value)
                    }
                    None => item.clone(),
                };
                self.dispatch_transformed(def, resolved, context).await;
            }
            return;
        }

        let resolved = match &def.mapping {
            Some(mapping) => template::resolve(mapping, data, context_value),
            None => data.clone(),
        };
        self.dispatch_transformed(def, resolved, context).await;
    }

    async fn dispatch_transformed(
        self: &Arc<Self>,
        def: &TransformerDef,
        resolved: Value,
        context: &ContextRecord,
    ) {
        let opts = EmitOptions::child_of(context);
        let target = def.target.clone();

        if def.is_async {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.emit_boxed(target.clone(), resolved, opts).await {
                    warn!(target = %target, error = %e, "async transformer emit failed");
                }
            });
        } else if let Err(e) = self.clone().emit_boxed(target.clone(), resolved, opts).await {
            warn!(target = %def.target, error = %e, "transformer emit failed");
        }
    }
}

macro_rules! upgrade {
    ($self:expr) => {
        $self.inner.upgrade().ok_or(RouterError::Closed)?
    };
}

impl RouterHandle {
    fn router(&self) -> Result<EventRouter, RouterError> {
        Ok(EventRouter {
            inner: upgrade!(self),
        })
    }

    pub async fn emit(&self, event: &str, data: Value) -> Result<Vec<Value>, RouterError> {
        self.router()?.emit(event, data).await
    }

    pub async fn emit_with(
        &self,
        event: &str,
        data: Value,
        opts: EmitOptions,
    ) -> Result<Vec<Value>, RouterError> {
        self.router()?.emit_with(event, data, opts).await
    }

    pub async fn emit_first(
        &self,
        event: &str,
        data: Value,
        opts: EmitOptions,
    ) -> Result<Option<Value>, RouterError> {
        self.router()?.emit_first(event, data, opts).await
    }

    pub async fn emit_first_timeout(
        &self,
        event: &str,
        data: Value,
        opts: EmitOptions,
        timeout: Duration,
    ) -> Result<Option<Value>, RouterError> {
        self.router()?
            .emit_first_timeout(event, data, opts, timeout)
            .await
    }

    pub fn register_transformer(
        &self,
        def: TransformerDef,
        rule_id: Option<RuleId>,
        priority: i64,
        guard: Option<SourceGuard>,
    ) -> Result<(), RouterError> {
        self.router()?
            .register_transformer(def, rule_id, priority, guard);
        Ok(())
    }

    pub fn unregister_rule_transformers(&self, rule_id: &RuleId) -> Result<(), RouterError> {
        self.router()?.unregister_rule_transformers(rule_id);
        Ok(())
    }

    pub fn decisions(&self) -> Result<Vec<RoutingDecision>, RouterError> {
        Ok(self.router()?.decisions())
    }

    pub fn contexts(&self) -> Result<Arc<ContextManager>, RouterError> {
        Ok(self.router()?.contexts())
    }

    pub fn event_log(&self) -> Result<Option<EventLog>, RouterError> {
        Ok(self.router()?.event_log())
    }

    pub fn handler_catalog(&self) -> Result<Vec<HandlerMeta>, RouterError> {
        Ok(self.router()?.handler_catalog())
    }

    pub fn transformer_count(&self) -> Result<usize, RouterError> {
        Ok(self.router()?.transformer_count())
    }

    pub fn events_emitted(&self) -> Result<u64, RouterError> {
        Ok(self.router()?.events_emitted())
    }

    pub fn task_names(&self) -> Result<Vec<String>, RouterError> {
        Ok(self.router()?.task_names())
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
