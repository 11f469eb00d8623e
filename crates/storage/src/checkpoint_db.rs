// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Checkpoint storage.
//!
//! Snapshots of live runtime state (queued requests, session queues, hot
//! context, agent and identity entities) in a relational schema. Only the
//! newest five checkpoints stay `active`; older ones are archived in the
//! same transaction that writes a new checkpoint. The context sub-snapshot
//! is saved in a second transaction and is allowed to fail without
//! invalidating the primary checkpoint.

use crate::db::{open_pool, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Checkpoints beyond this many newest rows are archived.
const ACTIVE_CHECKPOINTS: i64 = 5;

/// One tracked request at checkpoint time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub session_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub data: Value,
    pub queued_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
}

/// A request sitting in a session queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub request_id: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: Option<String>,
}

/// One session queue at checkpoint time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionQueueSnapshot {
    #[serde(default)]
    pub items: Vec<QueuedRequest>,
    #[serde(default)]
    pub is_active: bool,
    pub active_request: Option<String>,
}

/// Collected checkpoint state, merged from participating services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    #[serde(default)]
    pub checkpoint_id: Option<i64>,
    pub created_at: String,
    pub reason: String,
    /// `active_completions` in the wire protocol.
    #[serde(default)]
    pub requests: HashMap<String, RequestSnapshot>,
    #[serde(default)]
    pub sessions: HashMap<String, SessionQueueSnapshot>,
    #[serde(default)]
    pub agents: HashMap<String, Value>,
    #[serde(default)]
    pub identities: HashMap<String, Value>,
}

impl CheckpointData {
    /// (requests, sessions) counts. Queued items living only in session
    /// queues count as requests too, so totals are stable across a
    /// save/load cycle.
    pub fn totals(&self) -> (i64, i64) {
        let queued_only = self
            .sessions
            .values()
            .flat_map(|s| &s.items)
            .filter(|item| !self.requests.contains_key(&item.request_id))
            .count();
        (
            (self.requests.len() + queued_only) as i64,
            self.sessions.len() as i64,
        )
    }
}

/// Status row describing one checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub id: i64,
    pub created_at: String,
    pub reason: String,
    pub status: String,
    pub total_requests: i64,
    pub total_sessions: i64,
}

/// Handle to the checkpoint database.
///
/// The checkpoint engine is the sole writer; operations are infrequent
/// enough that it runs its transactions directly rather than through a
/// queue-fed writer task.
#[derive(Clone)]
pub struct CheckpointDb {
    pool: SqlitePool,
}

impl CheckpointDb {
    pub async fn open(path: &Path, reset: bool) -> Result<Self, StorageError> {
        if reset && path.exists() {
            std::fs::remove_file(path)?;
            info!(path = %path.display(), "reset checkpoint database");
        }
        let pool = open_pool(path).await?;
        create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Write a checkpoint in one transaction, archiving checkpoints beyond
    /// the newest five. Returns the new checkpoint id.
    pub async fn save(&self, data: &CheckpointData) -> Result<i64, StorageError> {
        let (total_requests, total_sessions) = data.totals();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO checkpoints (created_at, reason, status, total_requests, total_sessions) \
             VALUES (?, ?, 'active', ?, ?)",
        )
        .bind(&data.created_at)
        .bind(&data.reason)
        .bind(total_requests)
        .bind(total_sessions)
        .execute(&mut *tx)
        .await?;
        let checkpoint_id = result.last_insert_rowid();

        for (request_id, snapshot) in &data.requests {
            sqlx::query(
                "INSERT INTO checkpoint_requests \
                 (checkpoint_id, request_id, session_id, status, request_data, \
                  queued_at, started_at, completed_at, error) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(checkpoint_id)
            .bind(request_id)
            .bind(&snapshot.session_id)
            .bind(&snapshot.status)
            .bind(serde_json::to_string(&snapshot.data)?)
            .bind(&snapshot.queued_at)
            .bind(&snapshot.started_at)
            .bind(&snapshot.completed_at)
            .bind(&snapshot.error)
            .execute(&mut *tx)
            .await?;
        }

        for (session_id, session) in &data.sessions {
            sqlx::query(
                "INSERT INTO checkpoint_sessions \
                 (checkpoint_id, session_id, queue_depth, is_active, active_request) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(checkpoint_id)
            .bind(session_id)
            .bind(session.items.len() as i64)
            .bind(i64::from(session.is_active))
            .bind(&session.active_request)
            .execute(&mut *tx)
            .await?;

            for item in &session.items {
                // A queued item may also appear among the tracked
                // requests; the richer row wins.
                sqlx::query(
                    "INSERT OR IGNORE INTO checkpoint_requests \
                     (checkpoint_id, request_id, session_id, status, request_data, queued_at) \
                     VALUES (?, ?, ?, 'queued', ?, ?)",
                )
                .bind(checkpoint_id)
                .bind(&item.request_id)
                .bind(session_id)
                .bind(serde_json::to_string(&item.data)?)
                .bind(&item.timestamp)
                .execute(&mut *tx)
                .await?;
            }
        }

        for (agent_id, agent_data) in &data.agents {
            sqlx::query(
                "INSERT INTO checkpoint_agents (checkpoint_id, agent_id, agent_data) \
                 VALUES (?, ?, ?)",
            )
            .bind(checkpoint_id)
            .bind(agent_id)
            .bind(serde_json::to_string(agent_data)?)
            .execute(&mut *tx)
            .await?;
        }

        for (agent_id, identity_data) in &data.identities {
            sqlx::query(
                "INSERT INTO checkpoint_identities (checkpoint_id, agent_id, identity_data) \
                 VALUES (?, ?, ?)",
            )
            .bind(checkpoint_id)
            .bind(agent_id)
            .bind(serde_json::to_string(identity_data)?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE checkpoints SET status = 'archived' \
             WHERE id NOT IN ( \
                 SELECT id FROM checkpoints WHERE status = 'active' \
                 ORDER BY id DESC LIMIT ? \
             )",
        )
        .bind(ACTIVE_CHECKPOINTS)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(checkpoint_id)
    }

    /// Save the hot-context sub-snapshot (separate transaction).
    pub async fn save_context_snapshot(
        &self,
        checkpoint_id: i64,
        hot_snapshot: &Value,
        active_correlations: &Value,
        stats: &Value,
        created_at: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO checkpoint_contexts \
             (checkpoint_id, hot_storage_snapshot, active_correlations, context_stats, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(checkpoint_id)
        .bind(serde_json::to_string(hot_snapshot)?)
        .bind(serde_json::to_string(active_correlations)?)
        .bind(serde_json::to_string(stats)?)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load the newest `active` checkpoint with its requests and sessions.
    pub async fn load_latest(&self) -> Result<Option<CheckpointData>, StorageError> {
        let row = sqlx::query(
            "SELECT id, created_at, reason FROM checkpoints \
             WHERE status = 'active' ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let checkpoint_id: i64 = row.get("id");

        let mut data = CheckpointData {
            checkpoint_id: Some(checkpoint_id),
            created_at: row.get("created_at"),
            reason: row.get("reason"),
            ..Default::default()
        };

        let request_rows = sqlx::query(
            "SELECT request_id, session_id, status, request_data, \
                    queued_at, started_at, completed_at, error \
             FROM checkpoint_requests WHERE checkpoint_id = ? ORDER BY id",
        )
        .bind(checkpoint_id)
        .fetch_all(&self.pool)
        .await?;

        for row in &request_rows {
            let request_id: String = row.get("request_id");
            let status: String = row.get("status");
            let request_data: String = row.get("request_data");
            let snapshot = RequestSnapshot {
                session_id: row.get("session_id"),
                status: status.clone(),
                data: serde_json::from_str(&request_data).unwrap_or(Value::Null),
                queued_at: row.get("queued_at"),
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
                error: row.get("error"),
            };

            if status == "queued" {
                if let Some(session_id) = snapshot.session_id.clone() {
                    data.sessions
                        .entry(session_id)
                        .or_default()
                        .items
                        .push(QueuedRequest {
                            request_id: request_id.clone(),
                            data: snapshot.data.clone(),
                            timestamp: snapshot.queued_at.clone(),
                        });
                }
            }
            data.requests.insert(request_id, snapshot);
        }

        let session_rows = sqlx::query(
            "SELECT session_id, is_active, active_request \
             FROM checkpoint_sessions WHERE checkpoint_id = ?",
        )
        .bind(checkpoint_id)
        .fetch_all(&self.pool)
        .await?;
        for row in &session_rows {
            let session_id: String = row.get("session_id");
            let entry = data.sessions.entry(session_id).or_default();
            entry.is_active = row.get::<i64, _>("is_active") != 0;
            entry.active_request = row.get("active_request");
        }

        let agent_rows =
            sqlx::query("SELECT agent_id, agent_data FROM checkpoint_agents WHERE checkpoint_id = ?")
                .bind(checkpoint_id)
                .fetch_all(&self.pool)
                .await?;
        for row in &agent_rows {
            let agent_id: String = row.get("agent_id");
            let blob: String = row.get("agent_data");
            data.agents
                .insert(agent_id, serde_json::from_str(&blob).unwrap_or(Value::Null));
        }

        let identity_rows = sqlx::query(
            "SELECT agent_id, identity_data FROM checkpoint_identities WHERE checkpoint_id = ?",
        )
        .bind(checkpoint_id)
        .fetch_all(&self.pool)
        .await?;
        for row in &identity_rows {
            let agent_id: String = row.get("agent_id");
            let blob: String = row.get("identity_data");
            data.identities
                .insert(agent_id, serde_json::from_str(&blob).unwrap_or(Value::Null));
        }

        Ok(Some(data))
    }

    /// Load the context sub-snapshot for a checkpoint, if one was saved.
    pub async fn load_context_snapshot(
        &self,
        checkpoint_id: i64,
    ) -> Result<Option<Value>, StorageError> {
        let row = sqlx::query(
            "SELECT hot_storage_snapshot FROM checkpoint_contexts \
             WHERE checkpoint_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let blob: String = row.get("hot_storage_snapshot");
                Ok(Some(serde_json::from_str(&blob)?))
            }
            None => Ok(None),
        }
    }

    /// Mark a checkpoint restored.
    pub async fn mark_restored(&self, checkpoint_id: i64, at: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE checkpoints SET restored_at = ? WHERE id = ?")
            .bind(at)
            .bind(checkpoint_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Summaries of all checkpoints, newest first.
    pub async fn list(&self) -> Result<Vec<CheckpointSummary>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, created_at, reason, status, total_requests, total_sessions \
             FROM checkpoints ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CheckpointSummary {
                id: row.get("id"),
                created_at: row.get("created_at"),
                reason: row.get("reason"),
                status: row.get("status"),
                total_requests: row.get("total_requests"),
                total_sessions: row.get("total_sessions"),
            })
            .collect())
    }

    /// Remove one request from the latest active checkpoint.
    pub async fn remove_request(&self, request_id: &str) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM checkpoint_requests WHERE request_id = ? AND checkpoint_id IN \
             (SELECT id FROM checkpoints WHERE status = 'active')",
        )
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Remove failed requests from active checkpoints.
    pub async fn clear_failed(&self) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM checkpoint_requests WHERE status = 'failed' AND checkpoint_id IN \
             (SELECT id FROM checkpoints WHERE status = 'active')",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drop all checkpoint state.
    pub async fn clear_all(&self) -> Result<(), StorageError> {
        for table in [
            "checkpoint_requests",
            "checkpoint_sessions",
            "checkpoint_contexts",
            "checkpoint_agents",
            "checkpoint_identities",
            "checkpoints",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

async fn create_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for stmt in [
        r#"CREATE TABLE IF NOT EXISTS checkpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            reason TEXT NOT NULL,
            restored_at TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            total_requests INTEGER NOT NULL DEFAULT 0,
            total_sessions INTEGER NOT NULL DEFAULT 0
        )"#,
        r#"CREATE TABLE IF NOT EXISTS checkpoint_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            checkpoint_id INTEGER NOT NULL,
            request_id TEXT NOT NULL,
            session_id TEXT,
            status TEXT NOT NULL,
            request_data TEXT NOT NULL,
            queued_at TEXT,
            started_at TEXT,
            completed_at TEXT,
            error TEXT,
            FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id),
            UNIQUE(checkpoint_id, request_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS checkpoint_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            checkpoint_id INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            queue_depth INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 0,
            active_request TEXT,
            FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id),
            UNIQUE(checkpoint_id, session_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS checkpoint_contexts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            checkpoint_id INTEGER NOT NULL,
            hot_storage_snapshot TEXT NOT NULL,
            active_correlations TEXT NOT NULL,
            context_stats TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS checkpoint_agents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            checkpoint_id INTEGER NOT NULL,
            agent_id TEXT NOT NULL,
            agent_data TEXT NOT NULL,
            FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id),
            UNIQUE(checkpoint_id, agent_id)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS checkpoint_identities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            checkpoint_id INTEGER NOT NULL,
            agent_id TEXT NOT NULL,
            identity_data TEXT NOT NULL,
            FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id),
            UNIQUE(checkpoint_id, agent_id)
        )"#,
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(status)",
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_created ON checkpoints(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_requests_checkpoint ON checkpoint_requests(checkpoint_id)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_checkpoint ON checkpoint_sessions(checkpoint_id)",
        "CREATE INDEX IF NOT EXISTS idx_agents_checkpoint ON checkpoint_agents(checkpoint_id)",
        "CREATE INDEX IF NOT EXISTS idx_identities_checkpoint ON checkpoint_identities(checkpoint_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "checkpoint_db_tests.rs"]
mod tests;
