// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Template variable interpolation for transformer mappings.
//!
//! Strings may mix literal text with any number of `{{expr}}` segments.
//! When the whole string is a single `{{expr}}` the resolved value keeps
//! its original JSON type; inside a larger string values are stringified.
//!
//! Expression grammar: `path ( "|" default )?` where `path` is `$` (the
//! whole data object), a dotted path with numeric indices resolved against
//! data first (then context for `_`-prefixed heads), or a function call
//! (`timestamp_utc()`, `len(x)`, `upper(x)`, `lower(x)`). Unknown
//! functions leave the template literal in place.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use thiserror::Error;

/// Regex for {{expression}} segments. Expressions never nest braces.
// Allow expect here as the regex is compile-time verified to be valid
#[allow(clippy::expect_used)]
static TEMPLATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("constant regex pattern is valid"));

/// Errors from template resolution.
///
/// Resolution is deliberately forgiving (missing paths become defaults or
/// empty strings); errors are reserved for structurally invalid templates.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid function call: {0}")]
    InvalidCall(String),
}

/// Lookup scope for one resolution pass.
///
/// `item`/`index` are only present inside a `foreach` expansion; their
/// names are frozen. `$` always refers to `data`.
#[derive(Clone, Copy)]
struct Scope<'a> {
    data: &'a Value,
    item: Option<&'a Value>,
    index: Option<usize>,
    context: &'a Value,
}

/// Outcome of resolving a single `{{expr}}`.
enum Resolved {
    Value(Value),
    /// Path missing and no default given.
    Missing,
    /// Unknown function name: the literal segment is preserved.
    KeepLiteral,
}

/// Recursively resolve a mapping tree against event data and context.
///
/// Objects and arrays are walked; every string leaf goes through
/// [`resolve_str`]; other leaves pass through unchanged.
pub fn resolve(template: &Value, data: &Value, context: &Value) -> Value {
    resolve_in_scope(
        template,
        Scope {
            data,
            item: None,
            index: None,
            context,
        },
    )
}

/// Resolve a mapping inside a `foreach` expansion.
///
/// The scope is `{$: data, item: <elem>, index: i}`: `item.*` and `index`
/// resolve to the current element while `$` stays the original data.
pub fn resolve_foreach(
    template: &Value,
    data: &Value,
    item: &Value,
    index: usize,
    context: &Value,
) -> Value {
    resolve_in_scope(
        template,
        Scope {
            data,
            item: Some(item),
            index: Some(index),
            context,
        },
    )
}

fn resolve_in_scope(template: &Value, scope: Scope<'_>) -> Value {
    match template {
        Value::String(s) => resolve_str_in_scope(s, scope),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_in_scope(v, scope));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_in_scope(v, scope))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve one string template.
///
/// A whole-string `{{expr}}` preserves the resolved value's type; mixed
/// strings concatenate stringified values, with missing paths resolving to
/// the empty string.
pub fn resolve_str(template: &str, data: &Value, context: &Value) -> Value {
    resolve_str_in_scope(
        template,
        Scope {
            data,
            item: None,
            index: None,
            context,
        },
    )
}

fn resolve_str_in_scope(template: &str, scope: Scope<'_>) -> Value {
    // Whole-string single expression: preserve the original type.
    if let Some(expr) = whole_expression(template) {
        return match resolve_expression(expr, scope) {
            Resolved::Value(v) => v,
            Resolved::Missing => Value::String(String::new()),
            Resolved::KeepLiteral => Value::String(template.to_string()),
        };
    }

    let replaced = TEMPLATE_PATTERN.replace_all(template, |caps: &regex::Captures| {
        match resolve_expression(&caps[1], scope) {
            Resolved::Value(v) => stringify(&v),
            Resolved::Missing => String::new(),
            Resolved::KeepLiteral => caps[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

/// Resolve a bare path or expression (no surrounding braces), as used by
/// `foreach` paths and condition operands. Returns `None` when missing.
pub fn resolve_path(expr: &str, data: &Value, context: &Value) -> Option<Value> {
    let scope = Scope {
        data,
        item: None,
        index: None,
        context,
    };
    match resolve_expression(expr, scope) {
        Resolved::Value(v) => Some(v),
        _ => None,
    }
}

/// When `template` is exactly one `{{expr}}`, return the inner expression.
fn whole_expression(template: &str) -> Option<&str> {
    if !template.starts_with("{{") || !template.ends_with("}}") || template.len() < 4 {
        return None;
    }
    let inner = &template[2..template.len() - 2];
    // Reject strings like "{{a}} and {{b}}" whose inner slice still holds braces.
    if inner.contains('{') || inner.contains('}') {
        return None;
    }
    Some(inner)
}

fn resolve_expression(expr: &str, scope: Scope<'_>) -> Resolved {
    let expr = expr.trim();
    let (path, default) = match expr.split_once('|') {
        Some((p, d)) => (p.trim(), Some(d.trim())),
        None => (expr, None),
    };

    let resolved = if path.ends_with(')') {
        resolve_call(path, scope)
    } else {
        lookup(path, scope).map_or(Resolved::Missing, Resolved::Value)
    };

    match resolved {
        Resolved::Missing => match default {
            Some(d) => Resolved::Value(parse_default(d)),
            None => Resolved::Missing,
        },
        other => other,
    }
}

/// Supported template functions. Unknown names keep the literal segment.
fn resolve_call(call: &str, scope: Scope<'_>) -> Resolved {
    let Some((name, rest)) = call.split_once('(') else {
        return Resolved::KeepLiteral;
    };
    let arg = rest.trim_end_matches(')').trim();

    match name.trim() {
        "timestamp_utc" => Resolved::Value(Value::String(timestamp_utc())),
        "len" => match lookup(arg, scope) {
            Some(Value::String(s)) => Resolved::Value(Value::from(s.chars().count())),
            Some(Value::Array(items)) => Resolved::Value(Value::from(items.len())),
            Some(Value::Object(map)) => Resolved::Value(Value::from(map.len())),
            _ => Resolved::Missing,
        },
        "upper" => match lookup(arg, scope) {
            Some(v) => Resolved::Value(Value::String(stringify(&v).to_uppercase())),
            None => Resolved::Missing,
        },
        "lower" => match lookup(arg, scope) {
            Some(v) => Resolved::Value(Value::String(stringify(&v).to_lowercase())),
            None => Resolved::Missing,
        },
        _ => Resolved::KeepLiteral,
    }
}

/// Current UTC time in RFC 3339 form, the format `timestamp_utc()` yields.
pub fn timestamp_utc() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Walk a dotted path with numeric indices.
///
/// `$` is the whole data object; `item`/`index` hit the foreach scope when
/// present. Paths resolve against data first; `_`-prefixed heads fall back
/// to the context record.
fn lookup(path: &str, scope: Scope<'_>) -> Option<Value> {
    if path == "$" {
        return Some(scope.data.clone());
    }

    if let Some(item) = scope.item {
        if path == "item" {
            return Some(item.clone());
        }
        if let Some(rest) = path.strip_prefix("item.") {
            return walk(item, rest);
        }
        if path == "index" {
            return scope.index.map(Value::from);
        }
    }

    if let Some(found) = walk(scope.data, path) {
        return Some(found);
    }
    if path.starts_with('_') {
        return walk(scope.context, path);
    }
    None
}

fn walk(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Parse a `|default` payload: int, float, bool, or null when it reads as
/// one; a plain string otherwise.
fn parse_default(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(raw.to_string())
}

/// Stringify a value for embedding inside a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
#[path = "template_tests.rs"]
mod tests;
