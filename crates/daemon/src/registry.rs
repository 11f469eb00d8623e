// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! System registry: typed runtime references shared across modules.
//!
//! No live objects travel over the event bus; modules that need the
//! state store, the emitter, or the shutdown signal receive this struct
//! at wiring time. `system:context` only announces that the registry is
//! available.

use ksi_engine::{RouterHandle, StateStore};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone)]
pub struct SystemRegistry {
    /// State entity store.
    pub state: Arc<StateStore>,
    /// Event emitter (weak router handle).
    pub emitter: RouterHandle,
    /// Shutdown coordination signal.
    pub shutdown: Arc<Notify>,
}

impl SystemRegistry {
    pub fn new(state: Arc<StateStore>, emitter: RouterHandle, shutdown: Arc<Notify>) -> Self {
        Self {
            state,
            emitter,
            shutdown,
        }
    }
}
