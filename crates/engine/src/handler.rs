// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Handler registration types.
//!
//! Handlers are explicit records inserted by each module's `register`
//! function: `{event, priority, handler}`. A handler receives the event
//! data plus an [`EventContext`] carrying the emission's context record
//! and a weak router handle for recursive emits.

use crate::router::RouterHandle;
use futures_util::future::BoxFuture;
use ksi_core::{ContextRecord, ErrorKind};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Priority levels for event handlers. Lower runs earlier in the
/// dispatch order (results keep that order; execution is concurrent).
pub mod priority {
    pub const HIGHEST: i32 = 0;
    pub const HIGH: i32 = 10;
    pub const NORMAL: i32 = 50;
    pub const LOW: i32 = 90;
    pub const LOWEST: i32 = 100;
}

/// Error raised by a handler; converted into a `system:error` emission.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HandlerFailure, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceFailure, message)
    }
}

/// `Ok(Some(value))` is returned to the caller, `Ok(None)` means
/// "completed, nothing to say", `Err` becomes `system:error`.
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// Per-invocation context handed to a handler.
#[derive(Clone)]
pub struct EventContext {
    /// Name of the event being handled.
    pub event: String,
    /// The emission's context record.
    pub context: ContextRecord,
    /// Weak handle to the router for recursive emits; child emissions
    /// link to this emission as their parent.
    pub handle: RouterHandle,
}

impl EventContext {
    /// Emit a child event whose context links back to this emission.
    pub async fn emit(&self, event: &str, data: Value) -> Result<Vec<Value>, crate::router::RouterError> {
        self.handle
            .emit_with(event, data, crate::router::EmitOptions::child_of(&self.context))
            .await
    }

    /// Emit a child event and return the first non-`None` result.
    pub async fn emit_first(
        &self,
        event: &str,
        data: Value,
    ) -> Result<Option<Value>, crate::router::RouterError> {
        self.handle
            .emit_first(event, data, crate::router::EmitOptions::child_of(&self.context))
            .await
    }

    /// The context in its wire form, for embedding as `_ksi_context`.
    pub fn context_value(&self) -> Value {
        self.context.to_value()
    }
}

/// An event handler. Implementations are usually built from async
/// closures via [`handler_fn`].
pub trait EventHandler: Send + Sync {
    fn handle(&self, data: Value, ctx: EventContext) -> BoxFuture<'static, HandlerResult>;
}

struct ClosureHandler<F> {
    f: F,
}

impl<F, Fut> EventHandler for ClosureHandler<F>
where
    F: Fn(Value, EventContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, data: Value, ctx: EventContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.f)(data, ctx))
    }
}

/// Wrap an async closure as a handler object.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Value, EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(ClosureHandler { f })
}

/// A registered handler with its dispatch metadata.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub module: String,
    pub event: String,
    pub priority: i32,
    pub handler: Arc<dyn EventHandler>,
}

/// Catalog row describing a registration (for `module:*` queries).
#[derive(Debug, Clone, serde::Serialize)]
pub struct HandlerMeta {
    pub module: String,
    pub event: String,
    pub priority: i32,
}
