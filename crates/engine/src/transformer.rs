// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transformer tables.
//!
//! Compiled transformers live in an immutable table behind the router;
//! writes clone-modify-swap the table so the emit path reads without a
//! lock. Dynamic routing rules keep a back-reference from the transformer
//! to the rule that created it for introspection and teardown.

use ksi_core::{matches_pattern, pattern::is_pattern, RuleId};
use ksi_transform::TransformerDef;
use std::collections::HashMap;
use std::sync::Arc;

/// Extra source filter applied before condition evaluation.
///
/// Needed by the universal broadcast transformer, which matches `*` but
/// must never re-enter on its own output or on transport chatter.
#[derive(Debug, Clone, Default)]
pub struct SourceGuard {
    pub exclude_prefixes: Vec<String>,
    pub exclude_events: Vec<String>,
}

impl SourceGuard {
    pub fn allows(&self, event: &str) -> bool {
        if self.exclude_events.iter().any(|e| e == event) {
            return false;
        }
        !self.exclude_prefixes.iter().any(|p| event.starts_with(p.as_str()))
    }
}

/// A transformer as held by the router.
#[derive(Clone)]
pub struct CompiledTransformer {
    pub def: TransformerDef,
    /// Routing rule that created this transformer, if any.
    pub rule_id: Option<RuleId>,
    /// Higher priority is applied first on conflict.
    pub priority: i64,
    pub guard: Option<SourceGuard>,
}

impl CompiledTransformer {
    pub fn label(&self) -> String {
        match &self.rule_id {
            Some(rule_id) => rule_id.as_str().to_string(),
            None => self.def.label(),
        }
    }

    fn matches(&self, event: &str) -> bool {
        if let Some(guard) = &self.guard {
            if !guard.allows(event) {
                return false;
            }
        }
        true
    }
}

/// Immutable lookup table: direct sources plus pattern sources.
#[derive(Default, Clone)]
pub struct TransformerTable {
    direct: HashMap<String, Vec<Arc<CompiledTransformer>>>,
    patterns: Vec<(String, Arc<CompiledTransformer>)>,
}

impl TransformerTable {
    /// All transformers whose source matches `event`, highest priority
    /// first.
    pub fn matching(&self, event: &str) -> Vec<Arc<CompiledTransformer>> {
        let mut out: Vec<Arc<CompiledTransformer>> = Vec::new();
        if let Some(direct) = self.direct.get(event) {
            out.extend(direct.iter().cloned());
        }
        for (pattern, transformer) in &self.patterns {
            if matches_pattern(event, pattern) {
                out.push(Arc::clone(transformer));
            }
        }
        out.retain(|t| t.matches(event));
        out.sort_by(|a, b| b.priority.cmp(&a.priority));
        out
    }

    /// New table with `transformer` added.
    pub fn with_added(&self, transformer: CompiledTransformer) -> Self {
        let mut next = self.clone();
        let transformer = Arc::new(transformer);
        if is_pattern(&transformer.def.source) {
            next.patterns
                .push((transformer.def.source.clone(), transformer));
        } else {
            next.direct
                .entry(transformer.def.source.clone())
                .or_default()
                .push(transformer);
        }
        next
    }

    /// New table without the transformers of one routing rule.
    pub fn without_rule(&self, rule_id: &RuleId) -> Self {
        let mut next = self.clone();
        for list in next.direct.values_mut() {
            list.retain(|t| t.rule_id.as_ref() != Some(rule_id));
        }
        next.direct.retain(|_, list| !list.is_empty());
        next.patterns
            .retain(|(_, t)| t.rule_id.as_ref() != Some(rule_id));
        next
    }

    /// New table without statically named transformers for a source.
    pub fn without_source(&self, source: &str) -> Self {
        let mut next = self.clone();
        next.direct.remove(source);
        next.patterns.retain(|(pattern, _)| pattern != source);
        next
    }

    pub fn len(&self) -> usize {
        self.direct.values().map(Vec::len).sum::<usize>() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sources with at least one registered transformer.
    pub fn sources(&self) -> Vec<String> {
        let mut out: Vec<String> = self.direct.keys().cloned().collect();
        out.extend(self.patterns.iter().map(|(p, _)| p.clone()));
        out.sort();
        out.dedup();
        out
    }
}

#[cfg(test)]
#[path = "transformer_tests.rs"]
mod tests;
