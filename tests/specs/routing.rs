// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::harness::{boot, connect, request};
use serde_json::json;

#[tokio::test]
async fn rule_rewrite_preserves_chain_identity() {
    let t = boot().await;
    let mut stream = connect(&t.daemon).await;

    let resp = request(
        &mut stream,
        json!({
            "event": "routing:add_rule",
            "data": {"rule_id": "r1", "source_pattern": "a:*", "target": "b:copy", "priority": 100}
        }),
    )
    .await;
    assert_eq!(resp["data"]["data"]["status"], json!("created"));

    request(&mut stream, json!({"event": "a:ping", "data": {"x": 1}})).await;

    let contexts = t.daemon.router.contexts();
    let parent = contexts.find_by_name("a:ping").expect("a:ping in hot storage");
    let child = contexts.find_by_name("b:copy").expect("b:copy emitted");
    assert_eq!(child.envelope.data, json!({"x": 1}));
    assert_eq!(
        child.context.parent_event_id.as_ref(),
        Some(&parent.context.event_id)
    );
    assert_eq!(child.context.correlation_id, parent.context.correlation_id);

    t.daemon.shutdown().await;
}

#[tokio::test]
async fn foreach_rule_fans_out() {
    let t = boot().await;
    let mut stream = connect(&t.daemon).await;

    request(
        &mut stream,
        json!({
            "event": "routing:add_rule",
            "data": {
                "rule_id": "r2",
                "source_pattern": "spawn_many",
                "target": "agent:spawn",
                "foreach": "data.agents",
                "mapping": {"agent_id": "{{item.id}}", "component": "{{item.component}}"}
            }
        }),
    )
    .await;

    request(
        &mut stream,
        json!({
            "event": "spawn_many",
            "data": {"agents": [{"id": "w1", "component": "c"}, {"id": "w2", "component": "c"}]}
        }),
    )
    .await;

    let contexts = t.daemon.router.contexts();
    let origin = contexts.find_by_name("spawn_many").unwrap();
    let spawns = contexts.by_correlation(origin.context.correlation_id.as_str());
    let mut agent_ids: Vec<String> = spawns
        .iter()
        .filter(|r| r.envelope.event_name == "agent:spawn")
        .map(|r| r.envelope.data["agent_id"].as_str().unwrap().to_string())
        .collect();
    agent_ids.sort();
    assert_eq!(agent_ids, vec!["w1".to_string(), "w2".to_string()]);

    t.daemon.shutdown().await;
}

#[tokio::test]
async fn uncapable_agent_is_denied() {
    let t = boot().await;
    let mut stream = connect(&t.daemon).await;

    request(
        &mut stream,
        json!({
            "event": "state:entity:create",
            "data": {"type": "agent", "id": "A", "properties": {"capabilities": []}}
        }),
    )
    .await;

    let resp = request(
        &mut stream,
        json!({
            "event": "routing:add_rule",
            "data": {"rule_id": "r1", "source_pattern": "a:*", "target": "b:c"},
            "_ksi_context": {"_agent_id": "A"}
        }),
    )
    .await;
    assert_eq!(resp["data"]["error"], json!("Permission denied"));
    assert_eq!(
        resp["data"]["details"]["required_capability"],
        json!("routing_control")
    );

    // No rule was added.
    let rules = request(&mut stream, json!({"event": "routing:query_rules"})).await;
    assert_eq!(rules["data"]["data"]["count"], json!(0));

    t.daemon.shutdown().await;
}

#[tokio::test]
async fn ttl_rule_expires_and_emits() {
    let t = boot().await;
    let mut stream = connect(&t.daemon).await;

    request(
        &mut stream,
        json!({
            "event": "routing:add_rule",
            "data": {"rule_id": "r3", "source_pattern": "a:*", "target": "b:c", "ttl": 1}
        }),
    )
    .await;

    // Past the TTL; the sweep (here triggered directly rather than
    // waiting out the minute interval) removes the rule.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    let removed = t
        .daemon
        .routing
        .expire_due_rules(&t.daemon.router.handle())
        .await;
    assert_eq!(removed, 1);

    let rules = request(&mut stream, json!({"event": "routing:query_rules"})).await;
    assert_eq!(rules["data"]["data"]["count"], json!(0));

    // routing:rule_expired was emitted and logged.
    let expired = t
        .daemon
        .router
        .contexts()
        .find_by_name("routing:rule_expired")
        .expect("rule_expired event");
    assert_eq!(expired.envelope.data["rule_id"], json!("r3"));

    t.daemon.shutdown().await;
}

#[tokio::test]
async fn broadcast_subscription_pushes_copies() {
    let t = boot().await;
    let mut subscriber = connect(&t.daemon).await;
    let mut emitter = connect(&t.daemon).await;

    let resp = request(
        &mut subscriber,
        json!({
            "event": "monitor:subscribe",
            "data": {"client_id": "spec_watcher", "patterns": ["job:*"]}
        }),
    )
    .await;
    assert_eq!(resp["data"]["data"]["status"], json!("subscribed"));

    request(&mut emitter, json!({"event": "job:started", "data": {"id": 7}})).await;

    // The next line on the subscriber connection is the pushed copy.
    let pushed = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = subscriber.read(&mut byte).await.unwrap();
            assert!(n > 0);
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        serde_json::from_slice::<serde_json::Value>(&buf).unwrap()
    })
    .await
    .unwrap();

    assert_eq!(pushed["event"], json!("job:started"));
    assert_eq!(pushed["data"], json!({"id": 7}));

    t.daemon.shutdown().await;
}
