// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Module catalog: discovery over the router's handler registrations.
//!
//! Replaces the original's decorator-time discovery with queries against
//! the explicit registration records.

use ksi_engine::{error_response, handler_fn, success_response, EventRouter};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub fn register(router: &EventRouter) {
    let module = "modules";

    let handle = router.handle();
    router.register_handler(
        module,
        "module:list",
        ksi_engine::handler::priority::NORMAL,
        handler_fn(move |_data, _ctx| {
            let handle = handle.clone();
            async move {
                let catalog = handle.handler_catalog().unwrap_or_default();
                let mut by_module: BTreeMap<String, usize> = BTreeMap::new();
                for meta in &catalog {
                    *by_module.entry(meta.module.clone()).or_default() += 1;
                }
                let modules: Vec<Value> = by_module
                    .into_iter()
                    .map(|(name, handlers)| json!({"name": name, "handlers": handlers}))
                    .collect();
                Ok(Some(success_response(json!({
                    "count": modules.len(),
                    "modules": modules,
                }))))
            }
        }),
    );

    let handle = router.handle();
    router.register_handler(
        module,
        "module:events",
        ksi_engine::handler::priority::NORMAL,
        handler_fn(move |data: Value, _ctx| {
            let handle = handle.clone();
            async move {
                let filter = data.get("module").and_then(Value::as_str).map(str::to_string);
                let catalog = handle.handler_catalog().unwrap_or_default();
                let mut events: Vec<String> = catalog
                    .iter()
                    .filter(|m| filter.as_deref().is_none_or(|f| m.module == f))
                    .map(|m| m.event.clone())
                    .collect();
                events.sort();
                events.dedup();
                Ok(Some(success_response(json!({
                    "count": events.len(),
                    "events": events,
                }))))
            }
        }),
    );

    let handle = router.handle();
    router.register_handler(
        module,
        "module:inspect",
        ksi_engine::handler::priority::NORMAL,
        handler_fn(move |data: Value, _ctx| {
            let handle = handle.clone();
            async move {
                let Some(name) = data.get("module_name").and_then(Value::as_str) else {
                    return Ok(Some(error_response("Missing module_name", None)));
                };
                let catalog = handle.handler_catalog().unwrap_or_default();
                let handlers: Vec<Value> = catalog
                    .iter()
                    .filter(|m| m.module == name)
                    .map(|m| json!({"event": m.event, "priority": m.priority}))
                    .collect();
                if handlers.is_empty() {
                    return Ok(Some(error_response(
                        "Module not found",
                        Some(json!({"module_name": name})),
                    )));
                }
                Ok(Some(success_response(json!({
                    "module": name,
                    "handlers": handlers,
                }))))
            }
        }),
    );
}

#[cfg(test)]
#[path = "modules_tests.rs"]
mod tests;
