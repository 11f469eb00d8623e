// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers: boot a daemon in a temp root, speak NDJSON to it.

use ksi_daemon::lifecycle::{startup, Config, Daemon};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub struct TestDaemon {
    pub daemon: Daemon,
    pub _dir: tempfile::TempDir,
}

pub async fn boot() -> TestDaemon {
    let dir = tempfile::tempdir().expect("tempdir");
    let daemon = startup(Config::at(dir.path())).await.expect("daemon startup");
    TestDaemon { daemon, _dir: dir }
}

pub async fn connect(daemon: &Daemon) -> UnixStream {
    UnixStream::connect(&daemon.config.socket_path)
        .await
        .expect("connect to daemon socket")
}

/// Send one request line and read one response line.
pub async fn request(stream: &mut UnixStream, payload: Value) -> Value {
    let line = payload.to_string();
    stream.write_all(line.as_bytes()).await.expect("write");
    stream.write_all(b"\n").await.expect("write newline");

    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.expect("read");
        assert!(n > 0, "connection closed before response");
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
    }
    serde_json::from_slice(&buf).expect("response is json")
}
