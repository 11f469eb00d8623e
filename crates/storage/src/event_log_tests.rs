// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use ksi_core::{ContextOverrides, CorrelationId, EventId};
use serde_json::json;

fn context(event_id: &str, corr: &str, agent: Option<&str>) -> ContextRecord {
    ContextRecord::root(
        EventId::new(event_id),
        1_700_000_000.0,
        CorrelationId::new(corr),
        ContextOverrides {
            agent_id: agent.map(ksi_core::AgentId::new),
            ..Default::default()
        },
    )
}

fn envelope(event_id: &str, name: &str, corr: &str) -> (EventEnvelope, ContextRecord) {
    let ctx = context(event_id, corr, Some("agent_a"));
    let env = EventEnvelope::from_context(name, json!({"n": event_id}), &ctx);
    (env, ctx)
}

async fn open_log(dir: &tempfile::TempDir) -> (EventLog, tokio::task::JoinHandle<()>) {
    EventLog::open(&dir.path().join("events"), &dir.path().join("events.db"))
        .await
        .unwrap()
}

#[tokio::test]
async fn append_then_reconstruct() {
    let dir = tempfile::tempdir().unwrap();
    let (log, _writer) = open_log(&dir).await;

    let (env, ctx) = envelope("evt_1", "agent:spawn", "corr_1");
    log.append(&env, &ctx).await.unwrap();
    log.flush().await.unwrap();

    let meta = log.get_meta("evt_1").await.unwrap().unwrap();
    assert_eq!(meta.event_name, "agent:spawn");
    assert_eq!(meta.context_ref, "ctx_evt_1");

    let loaded = log.read_at(&meta.jsonl_file, meta.jsonl_offset).await.unwrap().unwrap();
    assert_eq!(loaded, env);

    let by_id = log.read_event("evt_1").await.unwrap().unwrap();
    assert_eq!(by_id, env);
}

#[tokio::test]
async fn offsets_distinguish_events_in_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let (log, _writer) = open_log(&dir).await;

    for i in 0..5 {
        let (env, ctx) = envelope(&format!("evt_{i}"), "a:b", "corr_1");
        log.append(&env, &ctx).await.unwrap();
    }
    log.flush().await.unwrap();

    for i in 0..5 {
        let loaded = log.read_event(&format!("evt_{i}")).await.unwrap().unwrap();
        assert_eq!(loaded.data, json!({"n": format!("evt_{i}")}));
    }
}

#[tokio::test]
async fn query_by_pattern_respects_segments() {
    let dir = tempfile::tempdir().unwrap();
    let (log, _writer) = open_log(&dir).await;

    for (id, name) in [
        ("evt_1", "agent:spawn"),
        ("evt_2", "agent:spawn:worker"),
        ("evt_3", "state:entity:get"),
    ] {
        let (env, ctx) = envelope(id, name, "corr_1");
        log.append(&env, &ctx).await.unwrap();
    }
    log.flush().await.unwrap();

    let metas = log
        .query(&EventQuery {
            name_pattern: Some("agent:*".into()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    // agent:spawn matches; agent:spawn:worker has a different segment count.
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].event_name, "agent:spawn");
}

#[tokio::test]
async fn query_by_correlation_and_agent() {
    let dir = tempfile::tempdir().unwrap();
    let (log, _writer) = open_log(&dir).await;

    let (env_a, ctx_a) = envelope("evt_a", "x:y", "corr_a");
    let (env_b, ctx_b) = envelope("evt_b", "x:y", "corr_b");
    log.append(&env_a, &ctx_a).await.unwrap();
    log.append(&env_b, &ctx_b).await.unwrap();
    log.flush().await.unwrap();

    let metas = log
        .query(&EventQuery {
            correlation_id: Some("corr_a".into()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(metas.len(), 1);
    assert_eq!(metas[0].event_id, "evt_a");

    let metas = log
        .query(&EventQuery {
            agent_id: Some("agent_a".into()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(metas.len(), 2);
}

#[tokio::test]
async fn newest_first_ordering_and_limit() {
    let dir = tempfile::tempdir().unwrap();
    let (log, _writer) = open_log(&dir).await;

    for i in 0..4 {
        let ctx = ContextRecord::root(
            EventId::new(format!("evt_{i}")),
            1_700_000_000.0 + i as f64,
            CorrelationId::new("corr_1"),
            ContextOverrides::default(),
        );
        let env = EventEnvelope::from_context("t:tick", json!({}), &ctx);
        log.append(&env, &ctx).await.unwrap();
    }
    log.flush().await.unwrap();

    let metas = log.query(&EventQuery::newest(2)).await.unwrap();
    assert_eq!(metas.len(), 2);
    assert_eq!(metas[0].event_id, "evt_3");
    assert_eq!(metas[1].event_id, "evt_2");

    let oldest = log
        .query(&EventQuery {
            limit: 2,
            newest_first: false,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(oldest[0].event_id, "evt_0");
}

#[tokio::test]
async fn sweep_removes_old_index_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (log, _writer) = open_log(&dir).await;

    let (env, ctx) = envelope("evt_1", "a:b", "corr_1");
    log.append(&env, &ctx).await.unwrap();
    log.flush().await.unwrap();

    assert_eq!(log.sweep_index_before(envelope_cutoff()).await.unwrap(), 1);
    assert_eq!(log.count().await.unwrap(), 0);
}

fn envelope_cutoff() -> f64 {
    1_800_000_000.0
}

#[tokio::test]
async fn files_are_named_by_day() {
    let dir = tempfile::tempdir().unwrap();
    let (log, _writer) = open_log(&dir).await;

    let (env, ctx) = envelope("evt_1", "a:b", "corr_1");
    log.append(&env, &ctx).await.unwrap();
    log.flush().await.unwrap();

    let meta = log.get_meta("evt_1").await.unwrap().unwrap();
    // 1_700_000_000 is 2023-11-14 UTC.
    assert_eq!(meta.jsonl_file, "events_2023-11-14.jsonl");
    assert!(dir.path().join("events").join(&meta.jsonl_file).exists());
}
