// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket transport.
//!
//! Same envelope semantics as the Unix socket, carried in text frames.
//! The optional CORS origin whitelist is enforced at upgrade time; on
//! connect the client receives `transport:connected` with its assigned
//! client id.

use super::{dispatch_request, TransportError};
use crate::monitor::MonitorService;
use crate::protocol;
use futures_util::{SinkExt, StreamExt};
use ksi_core::{ClientId, Clock, IdGen, SystemClock};
use ksi_engine::RouterHandle;
use serde_json::json;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub struct WebSocketTransport {
    accept_task: JoinHandle<()>,
    local_addr: std::net::SocketAddr,
}

impl WebSocketTransport {
    /// Bind `host:port` and start accepting upgrades.
    pub async fn spawn(
        host: &str,
        port: u16,
        cors_origins: Vec<String>,
        handle: RouterHandle,
        monitor: Arc<MonitorService>,
        idgen: Arc<dyn IdGen>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!(host, port = local_addr.port(), "websocket transport listening");

        let accept_task = tokio::spawn(accept_loop(listener, cors_origins, handle, monitor, idgen));
        Ok(Self {
            accept_task,
            local_addr,
        })
    }

    /// Bound address (useful when spawned with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.accept_task.abort();
        info!("websocket transport stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    cors_origins: Vec<String>,
    handle: RouterHandle,
    monitor: Arc<MonitorService>,
    idgen: Arc<dyn IdGen>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "websocket connection");
                let handle = handle.clone();
                let monitor = Arc::clone(&monitor);
                let cors = cors_origins.clone();
                let client_id = idgen.client_id("ws");
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, cors, client_id, handle, monitor).await
                    {
                        debug!(error = %e, "websocket connection ended with error");
                    }
                });
            }
            Err(e) => error!(error = %e, "websocket accept error"),
        }
    }
}

/// Enforce the origin whitelist during the upgrade handshake.
fn origin_check(
    cors_origins: &[String],
) -> impl FnOnce(&Request, Response) -> Result<Response, ErrorResponse> + '_ {
    move |request: &Request, response: Response| {
        if cors_origins.is_empty() || cors_origins.iter().any(|o| o == "*") {
            return Ok(response);
        }
        let origin = request
            .headers()
            .get("Origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if cors_origins.iter().any(|allowed| allowed == origin) {
            Ok(response)
        } else {
            warn!(origin, "rejected websocket connection by origin");
            let mut forbidden = ErrorResponse::new(Some("Forbidden".to_string()));
            *forbidden.status_mut() = StatusCode::FORBIDDEN;
            Err(forbidden)
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    cors_origins: Vec<String>,
    client_id: ClientId,
    handle: RouterHandle,
    monitor: Arc<MonitorService>,
) -> Result<(), TransportError> {
    let ws = tokio_tungstenite::accept_hdr_async(stream, origin_check(&cors_origins)).await?;
    debug!(client = %client_id, "websocket client connected");

    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if sink.send(Message::text(line)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Connection greeting with the assigned client id.
    let greeting = json!({
        "event": "transport:connected",
        "data": {
            "message": "Connected to KSI daemon via WebSocket",
            "client_id": client_id.as_str(),
            "transport": "websocket",
        },
    });
    let _ = tx.send(greeting.to_string());

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(client = %client_id, error = %e, "websocket read error");
                break;
            }
        };

        if message.is_close() {
            break;
        }
        let Ok(text) = message.to_text() else {
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }

        let request = match protocol::decode_request(text.trim()) {
            Ok(request) => request,
            Err(e) => {
                let clock = SystemClock;
                let envelope =
                    protocol::error_envelope(None, e.to_string(), None, clock.timestamp());
                let _ = tx.send(envelope.to_string());
                continue;
            }
        };

        let response = dispatch_request(request, &client_id, &handle, &monitor, &tx).await;
        if tx.send(response.to_string()).is_err() {
            break;
        }
    }

    monitor.unregister_client_writer(client_id.as_str());
    drop(tx);
    let _ = writer_task.await;
    debug!(client = %client_id, "websocket client disconnected");
    Ok(())
}

#[cfg(test)]
#[path = "websocket_tests.rs"]
mod tests;
