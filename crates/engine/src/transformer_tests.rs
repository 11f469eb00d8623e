// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn compiled(source: &str, target: &str, priority: i64, rule: Option<&str>) -> CompiledTransformer {
    CompiledTransformer {
        def: TransformerDef::new(source, target),
        rule_id: rule.map(RuleId::new),
        priority,
        guard: None,
    }
}

#[test]
fn direct_and_pattern_matching() {
    let table = TransformerTable::default()
        .with_added(compiled("a:b", "t:1", 100, None))
        .with_added(compiled("a:*", "t:2", 100, None))
        .with_added(compiled("*", "t:3", 100, None))
        .with_added(compiled("x:y", "t:4", 100, None));

    let matched = table.matching("a:b");
    let targets: Vec<&str> = matched.iter().map(|t| t.def.target.as_str()).collect();
    assert_eq!(targets.len(), 3);
    assert!(targets.contains(&"t:1"));
    assert!(targets.contains(&"t:2"));
    assert!(targets.contains(&"t:3"));
}

#[test]
fn higher_priority_first() {
    let table = TransformerTable::default()
        .with_added(compiled("a:b", "low", 10, None))
        .with_added(compiled("a:b", "high", 200, None))
        .with_added(compiled("a:*", "mid", 100, None));

    let matched = table.matching("a:b");
    let targets: Vec<&str> = matched.iter().map(|t| t.def.target.as_str()).collect();
    assert_eq!(targets, vec!["high", "mid", "low"]);
}

#[test]
fn source_guard_excludes() {
    let mut t = compiled("*", "monitor:broadcast_event", 0, None);
    t.guard = Some(SourceGuard {
        exclude_prefixes: vec!["transport:".into()],
        exclude_events: vec!["monitor:subscribe".into(), "monitor:broadcast_event".into()],
    });
    let table = TransformerTable::default().with_added(t);

    assert_eq!(table.matching("agent:spawn").len(), 1);
    assert!(table.matching("transport:connected").is_empty());
    assert!(table.matching("monitor:subscribe").is_empty());
    assert!(table.matching("monitor:broadcast_event").is_empty());
}

#[test]
fn remove_by_rule_id() {
    let table = TransformerTable::default()
        .with_added(compiled("a:b", "t:1", 100, Some("rule_1")))
        .with_added(compiled("a:*", "t:2", 100, Some("rule_1")))
        .with_added(compiled("a:b", "t:3", 100, Some("rule_2")));

    let trimmed = table.without_rule(&RuleId::new("rule_1"));
    assert_eq!(trimmed.len(), 1);
    assert_eq!(trimmed.matching("a:b")[0].def.target, "t:3");
    // Original table untouched (immutable snapshots).
    assert_eq!(table.len(), 3);
}

#[test]
fn remove_by_source() {
    let table = TransformerTable::default()
        .with_added(compiled("a:b", "t:1", 100, None))
        .with_added(compiled("c:*", "t:2", 100, None));

    let trimmed = table.without_source("a:b");
    assert_eq!(trimmed.len(), 1);
    let trimmed = trimmed.without_source("c:*");
    assert!(trimmed.is_empty());
}

#[test]
fn sources_lists_unique_sorted() {
    let table = TransformerTable::default()
        .with_added(compiled("b:x", "t", 0, None))
        .with_added(compiled("a:*", "t", 0, None))
        .with_added(compiled("b:x", "u", 0, None));
    assert_eq!(table.sources(), vec!["a:*".to_string(), "b:x".to_string()]);
}
