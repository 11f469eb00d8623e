// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::handler::{handler_fn, priority, HandlerError};
use ksi_core::{FakeClock, SequentialIdGen};
use serde_json::json;

fn test_router() -> EventRouter {
    EventRouter::new(RouterConfig {
        idgen: Arc::new(SequentialIdGen::new("t")),
        clock: Arc::new(FakeClock::new()),
        cold_contexts: None,
        event_log: None,
    })
}

type Captured = Arc<Mutex<Vec<(String, Value)>>>;

fn capture(router: &EventRouter, event: &str) -> Captured {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    router.register_handler(
        "test",
        event,
        priority::NORMAL,
        handler_fn(move |data, ctx| {
            let sink = sink.clone();
            async move {
                sink.lock().push((ctx.event.clone(), data));
                Ok(None)
            }
        }),
    );
    captured
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn emit_returns_non_none_results() {
    let router = test_router();
    router.register_handler(
        "m1",
        "q:sum",
        priority::NORMAL,
        handler_fn(|data: Value, _| async move {
            let n = data["n"].as_i64().unwrap_or(0);
            Ok(Some(json!({"doubled": n * 2})))
        }),
    );
    router.register_handler(
        "m2",
        "q:sum",
        priority::LOW,
        handler_fn(|_, _| async move { Ok(None) }),
    );

    let results = router.emit("q:sum", json!({"n": 4})).await.unwrap();
    assert_eq!(results, vec![json!({"doubled": 8})]);
}

#[tokio::test]
async fn unknown_event_returns_empty() {
    let router = test_router();
    assert!(router.emit("no:handlers", json!({})).await.unwrap().is_empty());
}

#[tokio::test]
async fn pattern_handlers_receive_matching_events() {
    let router = test_router();
    let captured = capture(&router, "agent:*");

    router.emit("agent:spawn", json!({"id": 1})).await.unwrap();
    router.emit("state:get", json!({})).await.unwrap();
    router.emit("agent:terminated", json!({"id": 2})).await.unwrap();

    let seen = captured.lock().clone();
    let names: Vec<&str> = seen.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["agent:spawn", "agent:terminated"]);
}

#[tokio::test]
async fn results_follow_priority_order() {
    let router = test_router();
    router.register_handler(
        "low",
        "p:ask",
        priority::LOW,
        handler_fn(|_, _| async move { Ok(Some(json!("low"))) }),
    );
    router.register_handler(
        "high",
        "p:ask",
        priority::HIGH,
        handler_fn(|_, _| async move { Ok(Some(json!("high"))) }),
    );

    let results = router.emit("p:ask", json!({})).await.unwrap();
    assert_eq!(results, vec![json!("high"), json!("low")]);

    let first = router
        .emit_first("p:ask", json!({}), EmitOptions::default())
        .await
        .unwrap();
    assert_eq!(first, Some(json!("high")));
}

#[tokio::test]
async fn transformer_reemits_with_child_context() {
    let router = test_router();
    let captured = capture(&router, "b:copy");

    router.register_transformer(TransformerDef::new("a:*", "b:copy"), None, 100, None);
    router.emit("a:ping", json!({"x": 1})).await.unwrap();

    // Pass-through mapping carries the data unchanged.
    assert_eq!(captured.lock().clone(), vec![("b:copy".to_string(), json!({"x": 1}))]);

    // The re-emitted event is a child of the original with the same
    // correlation id.
    let contexts = router.contexts();
    let parent = contexts.find_by_name("a:ping");
    let child = contexts.find_by_name("b:copy");
    let (parent, child) = (parent.unwrap(), child.unwrap());
    assert_eq!(
        child.context.parent_event_id.as_ref(),
        Some(&parent.context.event_id)
    );
    assert_eq!(child.context.correlation_id, parent.context.correlation_id);
    assert_eq!(child.context.event_depth, 1);
}

#[tokio::test]
async fn transformer_mapping_resolves_templates() {
    let router = test_router();
    let captured = capture(&router, "b:out");

    router.register_transformer(
        TransformerDef::new("a:in", "b:out")
            .with_mapping(json!({"label": "agent {{name}}", "whole": "{{$}}"})),
        None,
        100,
        None,
    );
    router.emit("a:in", json!({"name": "w1"})).await.unwrap();

    let seen = captured.lock().clone();
    assert_eq!(
        seen[0].1,
        json!({"label": "agent w1", "whole": {"name": "w1"}})
    );
}

#[tokio::test]
async fn transformer_condition_gates_reemit() {
    let router = test_router();
    let captured = capture(&router, "b:filtered");

    router.register_transformer(
        TransformerDef::new("a:evt", "b:filtered").with_condition("x > 5"),
        None,
        100,
        None,
    );

    router.emit("a:evt", json!({"x": 3})).await.unwrap();
    assert!(captured.lock().is_empty());

    router.emit("a:evt", json!({"x": 9})).await.unwrap();
    assert_eq!(captured.lock().len(), 1);
}

#[tokio::test]
async fn foreach_expands_each_item() {
    let router = test_router();
    let captured = capture(&router, "agent:spawn");

    router.register_transformer(
        TransformerDef::new("spawn_many", "agent:spawn")
            .with_foreach("data.agents")
            .with_mapping(json!({"agent_id": "{{item.id}}", "component": "{{item.component}}"})),
        None,
        100,
        None,
    );

    router
        .emit(
            "spawn_many",
            json!({"agents": [{"id": "w1", "component": "c"}, {"id": "w2", "component": "c"}]}),
        )
        .await
        .unwrap();

    let seen = captured.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].1, json!({"agent_id": "w1", "component": "c"}));
    assert_eq!(seen[1].1, json!({"agent_id": "w2", "component": "c"}));
}

#[tokio::test]
async fn async_transformer_is_detached() {
    let router = test_router();
    let captured = capture(&router, "b:later");

    router.register_transformer(
        TransformerDef::new("a:now", "b:later").into_async(),
        None,
        100,
        None,
    );
    router.emit("a:now", json!({"v": 1})).await.unwrap();

    let captured2 = captured.clone();
    wait_until(move || !captured2.lock().is_empty()).await;
    assert_eq!(captured.lock()[0].1, json!({"v": 1}));
}

#[tokio::test]
async fn handler_failure_becomes_system_error() {
    let router = test_router();
    let errors = capture(&router, "system:error");

    router.register_handler(
        "broken",
        "x:crash",
        priority::NORMAL,
        handler_fn(|_, _| async move {
            Err::<Option<Value>, _>(HandlerError::failure("boom"))
        }),
    );
    router.register_handler(
        "fine",
        "x:crash",
        priority::NORMAL,
        handler_fn(|_, _| async move { Ok(Some(json!("ok"))) }),
    );

    let results = router.emit("x:crash", json!({"input": 1})).await.unwrap();
    // The failing handler's result is excluded, the healthy one's kept.
    assert_eq!(results, vec![json!("ok")]);

    let errors2 = errors.clone();
    wait_until(move || !errors2.lock().is_empty()).await;
    let (_, payload) = errors.lock()[0].clone();
    assert_eq!(payload["error_type"], json!("handler_failure"));
    assert_eq!(payload["error_message"], json!("boom"));
    assert_eq!(payload["source"]["module"], json!("broken"));
    assert_eq!(payload["source"]["operation"], json!("x:crash"));
    assert_eq!(payload["original_data"], json!({"input": 1}));
    assert!(payload["_ksi_context"]["_event_id"].is_string());
}

#[tokio::test]
async fn emit_depth_is_bounded() {
    let router = test_router();
    let mut deep = ksi_core::ContextRecord::root(
        ksi_core::EventId::new("evt_deep"),
        0.0,
        ksi_core::CorrelationId::new("corr_deep"),
        Default::default(),
    );
    deep.event_depth = MAX_EMIT_DEPTH;

    let err = router
        .emit_with("too:deep", json!({}), EmitOptions::child_of(&deep))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::DepthExceeded { .. }));
}

#[tokio::test]
async fn handlers_can_emit_recursively() {
    let router = test_router();
    let captured = capture(&router, "chain:leaf");

    router.register_handler(
        "chain",
        "chain:start",
        priority::NORMAL,
        handler_fn(|_, ctx: crate::handler::EventContext| async move {
            ctx.emit("chain:leaf", json!({"hop": 1}))
                .await
                .map_err(|e| HandlerError::failure(e.to_string()))?;
            Ok(None)
        }),
    );

    router.emit("chain:start", json!({})).await.unwrap();
    assert_eq!(captured.lock().len(), 1);

    // Child emission inherits the chain.
    let contexts = router.contexts();
    let root = contexts.find_by_name("chain:start").unwrap();
    let leaf = contexts.find_by_name("chain:leaf").unwrap();
    assert_eq!(leaf.context.root_event_id, root.context.event_id);
    assert_eq!(leaf.context.event_depth, 1);
}

#[tokio::test]
async fn routing_decisions_are_recorded() {
    let router = test_router();
    router.register_transformer(
        TransformerDef::new("a:*", "b:hi").with_condition("x > 0"),
        Some(ksi_core::RuleId::new("rule_hi")),
        200,
        None,
    );
    router.register_transformer(
        TransformerDef::new("a:*", "b:lo"),
        Some(ksi_core::RuleId::new("rule_lo")),
        50,
        None,
    );

    router.emit("a:evt", json!({"x": 1})).await.unwrap();

    let decisions = router.decisions();
    let decision = decisions
        .iter()
        .find(|d| d.event_name == "a:evt")
        .unwrap();
    assert_eq!(decision.rules_evaluated.len(), 2);
    assert_eq!(decision.rules_matched.len(), 2);
    // Highest priority matched rule wins.
    assert_eq!(decision.rule_applied.as_deref(), Some("rule_hi"));
    assert!(decision.transformation_applied);

    // Condition false: evaluated but not matched.
    router.emit("a:evt", json!({"x": -1})).await.unwrap();
    let decisions = router.decisions();
    let last = decisions.last().unwrap();
    assert_eq!(last.rules_matched, vec!["rule_lo".to_string()]);
    assert_eq!(last.rule_applied.as_deref(), Some("rule_lo"));
}

#[tokio::test]
async fn emit_first_timeout_fires() {
    let router = test_router();
    router.register_handler(
        "slow",
        "s:wait",
        priority::NORMAL,
        handler_fn(|_, _| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Some(json!("late")))
        }),
    );

    let err = router
        .emit_first_timeout("s:wait", json!({}), EmitOptions::default(), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Timeout { .. }));
}

#[tokio::test]
async fn shutdown_acknowledgments_gate_completion() {
    let router = test_router();
    router.begin_shutdown();

    let services = vec!["state".to_string(), "routing".to_string()];
    assert!(
        !router
            .wait_for_shutdown_acks(&services, Duration::from_millis(50))
            .await
    );

    router
        .emit("shutdown:acknowledge", json!({"service": "state"}))
        .await
        .unwrap();
    router
        .emit("shutdown:acknowledge", json!({"service": "routing"}))
        .await
        .unwrap();
    assert!(
        router
            .wait_for_shutdown_acks(&services, Duration::from_millis(50))
            .await
    );
}

#[tokio::test]
async fn handle_outlives_check() {
    let router = test_router();
    let handle = router.handle();
    assert!(handle.emit("x:y", json!({})).await.is_ok());
    drop(router);
    assert!(matches!(
        handle.emit("x:y", json!({})).await.unwrap_err(),
        RouterError::Closed
    ));
}
