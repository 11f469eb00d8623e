// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Handler response conventions.
//!
//! Success payloads carry `{"status": "success", "data": {...}}`; error
//! payloads carry `{"error": "...", "details": {...}}`. Transports pass
//! these through verbatim, so the shapes are part of the wire contract.

use serde_json::{json, Value};

/// Build a success response wrapping `data`.
pub fn success_response(data: Value) -> Value {
    json!({"status": "success", "data": data})
}

/// Build an error response, optionally with structured details.
pub fn error_response(error: impl Into<String>, details: Option<Value>) -> Value {
    let mut out = json!({"error": error.into()});
    if let Some(details) = details {
        if let Some(map) = out.as_object_mut() {
            map.insert("details".to_string(), details);
        }
    }
    out
}

/// True when a response value reports success.
pub fn is_success(value: &Value) -> bool {
    value.get("status").and_then(Value::as_str) == Some("success")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes() {
        assert_eq!(
            success_response(json!({"n": 1})),
            json!({"status": "success", "data": {"n": 1}})
        );
        assert_eq!(
            error_response("Permission denied", Some(json!({"required_capability": "routing_control"}))),
            json!({"error": "Permission denied", "details": {"required_capability": "routing_control"}})
        );
        assert_eq!(error_response("nope", None), json!({"error": "nope"}));
        assert!(is_success(&success_response(json!({}))));
        assert!(!is_success(&error_response("x", None)));
    }
}
