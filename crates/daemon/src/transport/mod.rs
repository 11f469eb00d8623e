// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transports: Unix domain socket and WebSocket.
//!
//! Both carry newline-delimited JSON request envelopes in and response
//! envelopes out, and both register per-connection writers with the
//! monitor module so broadcast events can be pushed server-side.

mod unix;
mod websocket;

pub use unix::UnixTransport;
pub use websocket::WebSocketTransport;

use crate::monitor::MonitorService;
use crate::protocol::{self, RequestEnvelope};
use ksi_core::{ClientId, Clock, ContextOverrides, SystemClock};
use ksi_engine::{EmitOptions, RouterError, RouterHandle};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Handle one decoded request: emit it and build the response envelope.
///
/// Shared by both transports. The `_client_id` of the connection is
/// attached to the emission's context unless the caller supplied its own
/// `_ksi_context`. `monitor:subscribe` requests register the
/// connection's writer with the monitor before dispatch.
pub(crate) async fn dispatch_request(
    request: RequestEnvelope,
    client_id: &ClientId,
    handle: &RouterHandle,
    monitor: &Arc<MonitorService>,
    writer: &mpsc::UnboundedSender<String>,
) -> Value {
    let clock = SystemClock;

    if request.event == "monitor:subscribe" {
        let subscriber = request
            .data
            .get("client_id")
            .and_then(Value::as_str)
            .unwrap_or(client_id.as_str());
        monitor.register_client_writer(subscriber, writer.clone());
    }

    let mut overrides = request
        .ksi_context
        .as_ref()
        .map(ContextOverrides::from_wire)
        .unwrap_or_default();
    if overrides.client_id.is_none() {
        overrides.client_id = Some(client_id.clone());
    }
    let opts = EmitOptions::with_overrides(overrides);

    let emit = handle.emit_with(&request.event, request.data.clone(), opts);
    let result = match request.timeout {
        Some(secs) if secs > 0.0 => {
            match tokio::time::timeout(Duration::from_secs_f64(secs), emit).await {
                Ok(result) => result,
                Err(_) => Err(RouterError::Timeout {
                    event: request.event.clone(),
                }),
            }
        }
        _ => emit.await,
    };

    match result {
        Ok(results) => protocol::response_envelope(
            &request.event,
            results,
            request.correlation_id,
            clock.timestamp(),
        ),
        Err(e) => protocol::error_envelope(
            Some(&request.event),
            e.to_string(),
            request.correlation_id,
            clock.timestamp(),
        ),
    }
}
