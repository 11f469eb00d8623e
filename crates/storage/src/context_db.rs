// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Context cold storage.
//!
//! Contexts are written through a single writer task fed by a bounded
//! queue, preserving insert order and keeping transactions from
//! interleaving. Reads go straight to the pool. Rows expire 30 days after
//! creation; an hourly sweep deletes them.

use crate::db::{open_pool, StorageError, WRITE_QUEUE_DEPTH};
use ksi_core::ContextRecord;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Default retention for cold contexts (30 days).
pub const RETENTION_SECS: i64 = 30 * 24 * 3600;

enum ContextJob {
    Store {
        record: Box<ContextRecord>,
        created_at: i64,
    },
    /// Barrier used by shutdown and tests: acked once prior jobs landed.
    Flush(oneshot::Sender<()>),
}

/// Handle to the context cold store.
#[derive(Clone)]
pub struct ContextDb {
    pool: SqlitePool,
    tx: mpsc::Sender<ContextJob>,
}

impl ContextDb {
    /// Open the database, run the schema, and spawn the writer task.
    pub async fn open(path: &Path) -> Result<(Self, JoinHandle<()>), StorageError> {
        let pool = open_pool(path).await?;
        create_schema(&pool).await?;

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let writer = tokio::spawn(writer_task(pool.clone(), rx));

        Ok((Self { pool, tx }, writer))
    }

    /// Queue a context for persistence. Applies back-pressure when the
    /// write queue is full.
    pub async fn store(&self, record: &ContextRecord, created_at: i64) -> Result<(), StorageError> {
        self.tx
            .send(ContextJob::Store {
                record: Box::new(record.clone()),
                created_at,
            })
            .await
            .map_err(|_| StorageError::WriterClosed)
    }

    /// Wait until every previously queued write has been applied.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(ContextJob::Flush(ack))
            .await
            .map_err(|_| StorageError::WriterClosed)?;
        done.await.map_err(|_| StorageError::WriterClosed)
    }

    /// Fetch a context by reference.
    pub async fn get(&self, reference: &str) -> Result<Option<ContextRecord>, StorageError> {
        let row = sqlx::query("SELECT context_json FROM contexts WHERE ref = ?")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let json: String = row.get("context_json");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Fetch a context by the event id it was created for.
    pub async fn get_by_event(&self, event_id: &str) -> Result<Option<ContextRecord>, StorageError> {
        let row = sqlx::query("SELECT context_json FROM contexts WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let json: String = row.get("context_json");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Delete expired contexts. Returns the number of rows removed.
    pub async fn sweep_expired(&self, now: i64) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM contexts WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "swept expired contexts");
        }
        Ok(removed)
    }

    /// Number of stored contexts (used by status queries and tests).
    pub async fn count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM contexts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

async fn create_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contexts (
            ref TEXT PRIMARY KEY,
            event_id TEXT UNIQUE,
            correlation_id TEXT,
            session_id TEXT,
            agent_id TEXT,
            context_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_contexts_correlation ON contexts(correlation_id)",
        "CREATE INDEX IF NOT EXISTS idx_contexts_session ON contexts(session_id)",
        "CREATE INDEX IF NOT EXISTS idx_contexts_agent ON contexts(agent_id)",
        "CREATE INDEX IF NOT EXISTS idx_contexts_expires ON contexts(expires_at)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

async fn writer_task(pool: SqlitePool, mut rx: mpsc::Receiver<ContextJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            ContextJob::Store { record, created_at } => {
                if let Err(e) = insert_context(&pool, &record, created_at).await {
                    error!(reference = %record.reference, error = %e, "failed to persist context");
                }
            }
            ContextJob::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("context writer task stopped");
}

async fn insert_context(
    pool: &SqlitePool,
    record: &ContextRecord,
    created_at: i64,
) -> Result<(), StorageError> {
    let json = serde_json::to_string(record)?;
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO contexts
            (ref, event_id, correlation_id, session_id, agent_id,
             context_json, created_at, expires_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.reference.as_str())
    .bind(record.event_id.as_str())
    .bind(record.correlation_id.as_str())
    .bind(record.session_id().unwrap_or(""))
    .bind(record.agent_id.as_ref().map_or("", |a| a.as_str()))
    .bind(json)
    .bind(created_at)
    .bind(created_at + RETENTION_SECS)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
#[path = "context_db_tests.rs"]
mod tests;
