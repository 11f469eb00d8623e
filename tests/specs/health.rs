// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::harness::{boot, connect, request};
use serde_json::json;

#[tokio::test]
async fn health_envelope_over_unix_socket() {
    let t = boot().await;
    let mut stream = connect(&t.daemon).await;

    let resp = request(&mut stream, json!({"event": "system:health", "data": {}})).await;

    assert_eq!(resp["event"], json!("system:health"));
    assert_eq!(resp["count"], json!(1));
    assert_eq!(resp["correlation_id"], json!(null));
    assert_eq!(resp["data"]["status"], json!("healthy"));
    assert_eq!(resp["data"]["version"], json!("3.0.0"));
    assert!(resp["data"]["modules_loaded"].as_u64().unwrap() >= 1);
    assert!(resp["data"]["events_registered"].as_u64().unwrap() >= 1);
    assert!(resp["data"]["background_tasks"].as_u64().unwrap() >= 1);
    assert!(resp["data"]["uptime"].as_f64().unwrap() >= 0.0);
    assert!(resp["timestamp"].as_f64().unwrap() > 0.0);

    t.daemon.shutdown().await;
}

#[tokio::test]
async fn module_catalog_is_queryable() {
    let t = boot().await;
    let mut stream = connect(&t.daemon).await;

    let resp = request(&mut stream, json!({"event": "module:list"})).await;
    let modules = resp["data"]["data"]["modules"].as_array().unwrap();
    let names: Vec<&str> = modules
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"routing"));
    assert!(names.contains(&"monitor"));
    assert!(names.contains(&"state"));
    assert!(names.contains(&"checkpoint"));

    let resp = request(
        &mut stream,
        json!({"event": "module:events", "data": {"module": "routing"}}),
    )
    .await;
    let events = resp["data"]["data"]["events"].as_array().unwrap();
    assert!(events.iter().any(|e| e == "routing:add_rule"));

    t.daemon.shutdown().await;
}

#[tokio::test]
async fn events_are_logged_and_queryable() {
    let t = boot().await;
    let mut stream = connect(&t.daemon).await;

    request(
        &mut stream,
        json!({"event": "demo:tick", "data": {"n": 1}}),
    )
    .await;
    t.daemon.router.event_log().unwrap().flush().await.unwrap();

    let resp = request(
        &mut stream,
        json!({"event": "monitor:get_events", "data": {"event_patterns": ["demo:*"], "limit": 10}}),
    )
    .await;
    assert_eq!(resp["data"]["data"]["count"], json!(1));
    assert_eq!(
        resp["data"]["data"]["events"][0]["event_name"],
        json!("demo:tick")
    );

    t.daemon.shutdown().await;
}
