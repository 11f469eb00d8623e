// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use ksi_engine::{EmitOptions, EventRouter, RouterConfig};

#[tokio::test]
async fn health_reports_counts() {
    let router = EventRouter::new(RouterConfig::default());
    register(&router, Instant::now());
    // A second module so modules_loaded > 1.
    router.register_handler(
        "extra",
        "extra:noop",
        ksi_engine::handler::priority::NORMAL,
        handler_fn(|_, _| async move { Ok(None) }),
    );

    let resp = router
        .emit_first("system:health", json!({}), EmitOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(resp["status"], json!("healthy"));
    assert_eq!(resp["version"], json!("3.0.0"));
    assert!(resp["modules_loaded"].as_u64().unwrap() >= 1);
    assert!(resp["events_registered"].as_u64().unwrap() >= 1);
    assert!(resp["background_tasks"].as_u64().unwrap() == 0);
    assert!(resp["uptime"].as_f64().unwrap() >= 0.0);
}
