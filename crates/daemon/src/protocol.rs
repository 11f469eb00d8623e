// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire format for both transports: newline-delimited JSON envelopes.
//!
//! Request: `{event, data?, correlation_id?, _ksi_context?, timeout?}`.
//! Response: `{event, data, count, correlation_id, timestamp}` where
//! `data` is the single result object when `count == 1`, else the list.
//! Errors replace `data` with `error` in the same envelope shape.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncBufRead;

/// Bound on a single request line.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Line too long: over {max} bytes")]
    LineTooLong { max: usize },

    #[error("Missing event name")]
    MissingEvent,
}

/// Incoming request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub event: String,
    #[serde(default = "default_data")]
    pub data: Value,
    /// Echoed verbatim in the response.
    #[serde(default)]
    pub correlation_id: Option<Value>,
    #[serde(rename = "_ksi_context", default)]
    pub ksi_context: Option<Value>,
    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

fn default_data() -> Value {
    json!({})
}

/// Parse one request line.
pub fn decode_request(line: &str) -> Result<RequestEnvelope, ProtocolError> {
    let envelope: RequestEnvelope = serde_json::from_str(line)?;
    if envelope.event.is_empty() {
        return Err(ProtocolError::MissingEvent);
    }
    Ok(envelope)
}

/// Build the success response envelope: single result unwrapped, lists
/// kept as lists.
pub fn response_envelope(
    event: &str,
    results: Vec<Value>,
    correlation_id: Option<Value>,
    timestamp: f64,
) -> Value {
    let count = results.len();
    let data = if count == 1 {
        results.into_iter().next().unwrap_or(Value::Null)
    } else {
        Value::Array(results)
    };
    json!({
        "event": event,
        "data": data,
        "count": count,
        "correlation_id": correlation_id,
        "timestamp": timestamp,
    })
}

/// Build an error response envelope.
pub fn error_envelope(
    event: Option<&str>,
    error: impl Into<String>,
    correlation_id: Option<Value>,
    timestamp: f64,
) -> Value {
    json!({
        "event": event,
        "error": error.into(),
        "correlation_id": correlation_id,
        "timestamp": timestamp,
    })
}

/// Read one newline-delimited frame with a length bound.
///
/// Returns `None` at EOF. Frames beyond [`MAX_LINE_BYTES`] error out
/// rather than buffering without limit.
pub async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<String>, ProtocolError> {
    use tokio::io::AsyncBufReadExt;

    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            // EOF: a trailing unterminated line still counts as a frame.
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                line.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                break;
            }
            None => {
                line.extend_from_slice(available);
                let n = available.len();
                reader.consume(n);
            }
        }

        if line.len() > MAX_LINE_BYTES {
            return Err(ProtocolError::LineTooLong {
                max: MAX_LINE_BYTES,
            });
        }
    }

    let text = String::from_utf8_lossy(&line).trim().to_string();
    if text.is_empty() {
        // Blank line between requests; try the next frame.
        return Box::pin(read_frame(reader)).await;
    }
    Ok(Some(text))
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
