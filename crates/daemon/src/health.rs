// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Health check module.

use ksi_engine::{handler_fn, EventRouter};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Instant;

/// Runtime version reported by `system:health`.
pub const VERSION: &str = "3.0.0";

pub fn register(router: &EventRouter, start_time: Instant) {
    let handle = router.handle();
    router.register_handler(
        "health",
        "system:health",
        ksi_engine::handler::priority::NORMAL,
        handler_fn(move |_data: Value, _ctx| {
            let handle = handle.clone();
            async move {
                let catalog = handle.handler_catalog().unwrap_or_default();
                let modules: HashSet<&str> = catalog.iter().map(|h| h.module.as_str()).collect();
                let events: HashSet<&str> = catalog.iter().map(|h| h.event.as_str()).collect();
                let tasks = handle.task_names().unwrap_or_default();

                Ok(Some(json!({
                    "status": "healthy",
                    "modules_loaded": modules.len(),
                    "events_registered": events.len(),
                    "background_tasks": tasks.len(),
                    "version": VERSION,
                    "uptime": start_time.elapsed().as_secs_f64(),
                })))
            }
        }),
    );
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
