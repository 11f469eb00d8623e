// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the daemon crate.

use std::path::PathBuf;

/// Root directory holding `var/` (default: current directory).
pub fn root_dir() -> PathBuf {
    std::env::var("KSI_ROOT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Log filter, e.g. `info` or `ksi_engine=debug` (default: `info`).
pub fn log_level() -> String {
    std::env::var("KSI_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

pub fn checkpoint_disabled() -> bool {
    bool_var("KSI_CHECKPOINT_DISABLED")
}

pub fn reset_checkpoint_db() -> bool {
    bool_var("KSI_RESET_CHECKPOINT_DB")
}

/// WebSocket bind address; the transport only starts when a port is set.
pub fn websocket_bind() -> Option<(String, u16)> {
    let port: u16 = std::env::var("KSI_WS_PORT").ok()?.parse().ok()?;
    let host = std::env::var("KSI_WS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    Some((host, port))
}

/// CORS origin whitelist for the WebSocket transport. Empty means no
/// origin filtering.
pub fn websocket_cors_origins() -> Vec<String> {
    std::env::var("KSI_WS_CORS_ORIGINS")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn bool_var(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
