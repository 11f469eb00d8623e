// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reference event log: append-only JSONL files plus a SQLite index.
//!
//! Every emission is one JSON line. The log is never rewritten; rotation
//! starts a new file on UTC day change or when the current file exceeds
//! the size cap. The index row records which file and byte offset holds
//! the full event, with correlation/session/agent denormalized so queries
//! stay inside one database.

use crate::db::{open_pool, StorageError, WRITE_QUEUE_DEPTH};
use chrono::{TimeZone, Utc};
use ksi_core::{ContextRecord, EventEnvelope};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Rotate the JSONL file once it grows past this many bytes.
const MAX_FILE_BYTES: u64 = 64 * 1024 * 1024;

enum LogJob {
    Append {
        envelope: Box<EventEnvelope>,
        correlation_id: String,
        session_id: String,
        agent_id: String,
    },
    Flush(oneshot::Sender<()>),
}

/// Index row for one logged event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_id: String,
    pub event_name: String,
    pub timestamp: f64,
    pub context_ref: String,
    pub jsonl_file: String,
    pub jsonl_offset: i64,
}

/// Query over the event index.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Event name pattern (`*` wildcards allowed).
    pub name_pattern: Option<String>,
    pub correlation_id: Option<String>,
    pub agent_id: Option<String>,
    pub since: Option<f64>,
    pub until: Option<f64>,
    pub limit: u32,
    /// Newest-first when true (the default direction for monitors).
    pub newest_first: bool,
}

impl EventQuery {
    pub fn newest(limit: u32) -> Self {
        Self {
            limit,
            newest_first: true,
            ..Default::default()
        }
    }
}

/// Handle to the reference event log.
#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
    tx: mpsc::Sender<LogJob>,
    events_dir: PathBuf,
}

impl EventLog {
    /// Open the index database and spawn the writer task appending to
    /// JSONL files under `events_dir`.
    pub async fn open(
        events_dir: &Path,
        db_path: &Path,
    ) -> Result<(Self, JoinHandle<()>), StorageError> {
        std::fs::create_dir_all(events_dir)?;
        let pool = open_pool(db_path).await?;
        create_schema(&pool).await?;

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let writer = tokio::spawn(writer_task(pool.clone(), events_dir.to_path_buf(), rx));

        Ok((
            Self {
                pool,
                tx,
                events_dir: events_dir.to_path_buf(),
            },
            writer,
        ))
    }

    /// Append an emission to the log. Applies back-pressure when the
    /// write queue is full.
    pub async fn append(
        &self,
        envelope: &EventEnvelope,
        context: &ContextRecord,
    ) -> Result<(), StorageError> {
        self.tx
            .send(LogJob::Append {
                envelope: Box::new(envelope.clone()),
                correlation_id: context.correlation_id.as_str().to_string(),
                session_id: context.session_id().unwrap_or("").to_string(),
                agent_id: context
                    .agent_id
                    .as_ref()
                    .map_or(String::new(), |a| a.as_str().to_string()),
            })
            .await
            .map_err(|_| StorageError::WriterClosed)
    }

    /// Wait until every previously queued append has landed.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(LogJob::Flush(ack))
            .await
            .map_err(|_| StorageError::WriterClosed)?;
        done.await.map_err(|_| StorageError::WriterClosed)
    }

    /// Query the index. Name patterns are matched with the router's
    /// segment-wildcard semantics after a coarse SQL prefix filter.
    pub async fn query(&self, query: &EventQuery) -> Result<Vec<EventMeta>, StorageError> {
        let mut sql = String::from(
            "SELECT event_id, event_name, timestamp, context_ref, jsonl_file, jsonl_offset \
             FROM events WHERE 1=1",
        );
        let mut binds: Vec<String> = Vec::new();

        if let Some(pattern) = &query.name_pattern {
            if pattern != "*" {
                sql.push_str(" AND event_name LIKE ?");
                binds.push(pattern.replace('*', "%"));
            }
        }
        if let Some(corr) = &query.correlation_id {
            sql.push_str(" AND correlation_id = ?");
            binds.push(corr.clone());
        }
        if let Some(agent) = &query.agent_id {
            sql.push_str(" AND agent_id = ?");
            binds.push(agent.clone());
        }

        let mut q_since = None;
        if let Some(since) = query.since {
            sql.push_str(" AND timestamp >= ?");
            q_since = Some(since);
        }
        let mut q_until = None;
        if let Some(until) = query.until {
            sql.push_str(" AND timestamp <= ?");
            q_until = Some(until);
        }

        sql.push_str(if query.newest_first {
            " ORDER BY timestamp DESC, event_id DESC"
        } else {
            " ORDER BY timestamp ASC, event_id ASC"
        });
        let limit = if query.limit == 0 { 100 } else { query.limit };
        sql.push_str(" LIMIT ?");

        let mut prepared = sqlx::query(&sql);
        for bind in &binds {
            prepared = prepared.bind(bind);
        }
        if let Some(since) = q_since {
            prepared = prepared.bind(since);
        }
        if let Some(until) = q_until {
            prepared = prepared.bind(until);
        }
        prepared = prepared.bind(i64::from(limit));

        let rows = prepared.fetch_all(&self.pool).await?;
        let mut metas: Vec<EventMeta> = rows
            .iter()
            .map(|row| EventMeta {
                event_id: row.get("event_id"),
                event_name: row.get("event_name"),
                timestamp: row.get("timestamp"),
                context_ref: row.get("context_ref"),
                jsonl_file: row.get("jsonl_file"),
                jsonl_offset: row.get("jsonl_offset"),
            })
            .collect();

        // LIKE with % matches across segments; re-check with exact
        // segment-wildcard semantics.
        if let Some(pattern) = &query.name_pattern {
            metas.retain(|m| ksi_core::matches_pattern(&m.event_name, pattern));
        }

        Ok(metas)
    }

    /// Look up a single event's index row.
    pub async fn get_meta(&self, event_id: &str) -> Result<Option<EventMeta>, StorageError> {
        let row = sqlx::query(
            "SELECT event_id, event_name, timestamp, context_ref, jsonl_file, jsonl_offset \
             FROM events WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| EventMeta {
            event_id: row.get("event_id"),
            event_name: row.get("event_name"),
            timestamp: row.get("timestamp"),
            context_ref: row.get("context_ref"),
            jsonl_file: row.get("jsonl_file"),
            jsonl_offset: row.get("jsonl_offset"),
        }))
    }

    /// Reconstruct the full envelope by seeking into the JSONL file.
    pub async fn read_at(
        &self,
        jsonl_file: &str,
        offset: i64,
    ) -> Result<Option<EventEnvelope>, StorageError> {
        use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

        let path = self.events_dir.join(jsonl_file);
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        reader
            .seek(std::io::SeekFrom::Start(offset as u64))
            .await?;
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim())?))
    }

    /// Load the full envelope for an indexed event id.
    pub async fn read_event(&self, event_id: &str) -> Result<Option<EventEnvelope>, StorageError> {
        match self.get_meta(event_id).await? {
            Some(meta) => self.read_at(&meta.jsonl_file, meta.jsonl_offset).await,
            None => Ok(None),
        }
    }

    /// Delete index rows older than `cutoff` (retention sweep). The JSONL
    /// files themselves are never rewritten.
    pub async fn sweep_index_before(&self, cutoff: f64) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "swept expired event index rows");
        }
        Ok(removed)
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }
}

async fn create_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            event_id TEXT PRIMARY KEY,
            event_name TEXT NOT NULL,
            timestamp REAL NOT NULL,
            context_ref TEXT NOT NULL,
            correlation_id TEXT,
            session_id TEXT,
            agent_id TEXT,
            jsonl_file TEXT NOT NULL,
            jsonl_offset INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_events_name ON events(event_name)",
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        "CREATE INDEX IF NOT EXISTS idx_events_context ON events(context_ref)",
        "CREATE INDEX IF NOT EXISTS idx_events_correlation ON events(correlation_id)",
        "CREATE INDEX IF NOT EXISTS idx_events_agent ON events(agent_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

/// Open JSONL file state owned by the writer task.
struct ActiveFile {
    file: std::fs::File,
    name: String,
    day: String,
    offset: u64,
    seq: u32,
}

fn day_string(timestamp: f64) -> String {
    let secs = timestamp as i64;
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d")
        .to_string()
}

fn open_file(dir: &Path, day: &str, seq: u32) -> Result<ActiveFile, StorageError> {
    let name = if seq == 1 {
        format!("events_{day}.jsonl")
    } else {
        format!("events_{day}_{seq}.jsonl")
    };
    let path = dir.join(&name);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    let offset = file.metadata()?.len();
    Ok(ActiveFile {
        file,
        name,
        day: day.to_string(),
        offset,
        seq,
    })
}

async fn writer_task(pool: SqlitePool, events_dir: PathBuf, mut rx: mpsc::Receiver<LogJob>) {
    let mut active: Option<ActiveFile> = None;

    while let Some(job) = rx.recv().await {
        match job {
            LogJob::Append {
                envelope,
                correlation_id,
                session_id,
                agent_id,
            } => {
                if let Err(e) = append_one(
                    &pool,
                    &events_dir,
                    &mut active,
                    &envelope,
                    &correlation_id,
                    &session_id,
                    &agent_id,
                )
                .await
                {
                    error!(event = %envelope.event_name, error = %e, "failed to log event");
                }
            }
            LogJob::Flush(ack) => {
                if let Some(active) = active.as_mut() {
                    let _ = active.file.flush();
                }
                let _ = ack.send(());
            }
        }
    }
    debug!("event log writer task stopped");
}

async fn append_one(
    pool: &SqlitePool,
    events_dir: &Path,
    active: &mut Option<ActiveFile>,
    envelope: &EventEnvelope,
    correlation_id: &str,
    session_id: &str,
    agent_id: &str,
) -> Result<(), StorageError> {
    let day = day_string(envelope.timestamp);

    // Rotate on day change or size cap; rotation creates new files, the
    // old ones are never touched again.
    let needs_new = match active.as_ref() {
        None => true,
        Some(f) => f.day != day || f.offset >= MAX_FILE_BYTES,
    };
    if needs_new {
        let seq = match active.as_ref() {
            Some(f) if f.day == day => f.seq + 1,
            _ => 1,
        };
        *active = Some(open_file(events_dir, &day, seq)?);
    }

    let Some(file) = active.as_mut() else {
        return Ok(());
    };

    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    let offset = file.offset;
    file.file.write_all(&line)?;
    file.offset += line.len() as u64;

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO events
            (event_id, event_name, timestamp, context_ref,
             correlation_id, session_id, agent_id, jsonl_file, jsonl_offset)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(envelope.event_id.as_str())
    .bind(&envelope.event_name)
    .bind(envelope.timestamp)
    .bind(envelope.context_ref.as_str())
    .bind(correlation_id)
    .bind(session_id)
    .bind(agent_id)
    .bind(&file.name)
    .bind(offset as i64)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
#[path = "event_log_tests.rs"]
mod tests;
