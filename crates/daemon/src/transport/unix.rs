// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unix domain socket transport.
//!
//! Accepts unlimited concurrent connections; each runs a bounded-line
//! read loop and a writer task fed by a channel so request responses and
//! broadcast pushes interleave safely on one stream.

use super::{dispatch_request, TransportError};
use crate::monitor::MonitorService;
use crate::protocol::{self, ProtocolError};
use ksi_core::{ClientId, Clock, IdGen, SystemClock};
use ksi_engine::RouterHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct UnixTransport {
    socket_path: PathBuf,
    accept_task: JoinHandle<()>,
}

impl UnixTransport {
    /// Bind the socket (removing a stale one first) and start accepting.
    pub fn spawn(
        socket_path: &Path,
        handle: RouterHandle,
        monitor: Arc<MonitorService>,
        idgen: Arc<dyn IdGen>,
    ) -> Result<Self, TransportError> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "unix socket transport listening");

        let accept_task = tokio::spawn(accept_loop(listener, handle, monitor, idgen));

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            accept_task,
        })
    }

    /// Stop accepting and remove the socket file.
    pub fn stop(&self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.socket_path);
        info!("unix socket transport stopped");
    }
}

async fn accept_loop(
    listener: UnixListener,
    handle: RouterHandle,
    monitor: Arc<MonitorService>,
    idgen: Arc<dyn IdGen>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let handle = handle.clone();
                let monitor = Arc::clone(&monitor);
                let client_id = idgen.client_id("unix");
                tokio::spawn(async move {
                    handle_connection(stream, client_id, handle, monitor).await;
                });
            }
            Err(e) => {
                error!(error = %e, "unix accept error");
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    client_id: ClientId,
    handle: RouterHandle,
    monitor: Arc<MonitorService>,
) {
    debug!(client = %client_id, "client connected");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Writer task: responses and broadcast pushes share the channel.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = match protocol::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(ProtocolError::LineTooLong { max }) => {
                let clock = SystemClock;
                let envelope = protocol::error_envelope(
                    None,
                    format!("Line too long: over {max} bytes"),
                    None,
                    clock.timestamp(),
                );
                let _ = tx.send(envelope.to_string());
                break;
            }
            Err(e) => {
                debug!(client = %client_id, error = %e, "read error");
                break;
            }
        };

        let request = match protocol::decode_request(&frame) {
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
    debug!(client = %client_id, "client disconnected");
}

#[cfg(test)]
#[path = "unix_tests.rs"]
mod tests;
