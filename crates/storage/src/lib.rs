// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ksi-storage: durable state for the event runtime
//!
//! Three SQLite databases (WAL mode, one writer task each) and the
//! append-only JSONL reference event log:
//!
//! - `var/db/context.db` — context cold storage with 30-day retention
//! - `var/db/events.db` — event index over the JSONL log files
//! - `var/db/checkpoint.db` — checkpoint snapshots
//! - `var/lib/events/*.jsonl` — the reference event log itself

pub mod checkpoint_db;
pub mod context_db;
pub mod db;
pub mod event_log;

pub use checkpoint_db::{
    CheckpointDb, CheckpointData, CheckpointSummary, QueuedRequest, RequestSnapshot,
    SessionQueueSnapshot,
};
pub use context_db::ContextDb;
pub use db::{open_pool, StorageError};
pub use event_log::{EventLog, EventMeta, EventQuery};
