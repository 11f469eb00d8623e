// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy shared across the runtime.
//!
//! These are kinds, not concrete error types; each subsystem keeps its own
//! `thiserror` enum and maps into a kind when an error crosses the event
//! bus as `system:error`.

use serde::{Deserialize, Serialize};

/// Classification of a runtime error for routing and escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad envelope or parameters.
    Validation,
    /// Unknown rule/context/event.
    NotFound,
    /// Missing capability.
    Permission,
    Timeout,
    /// Transport-level I/O failure.
    Transport,
    /// Unresolved required template path.
    Template,
    /// A handler raised.
    HandlerFailure,
    TransformerFailure,
    ServiceFailure,
    /// Data corruption, handler crash cascades.
    Critical,
    /// Network, rate-limit, provider, temporary failures.
    Recoverable,
}

impl ErrorKind {
    /// Kinds escalated to `monitor:critical_error`.
    pub fn is_critical(self) -> bool {
        matches!(self, ErrorKind::Critical)
    }

    /// Kinds that trigger `error:recovery:attempt` with a retry strategy.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::Recoverable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Permission => "permission",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::Template => "template",
            ErrorKind::HandlerFailure => "handler_failure",
            ErrorKind::TransformerFailure => "transformer_failure",
            ErrorKind::ServiceFailure => "service_failure",
            ErrorKind::Critical => "critical",
            ErrorKind::Recoverable => "recoverable",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
