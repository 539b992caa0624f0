//! Database module for convoflow
//!
//! Persists conversation contexts and the session lock table in SQLite.

mod schema;

pub use schema::*;

use crate::context::{FlowContext, SessionKey};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Stored context for {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        // Several engine processes may share one file
        conn.busy_timeout(Duration::from_secs(5))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Context Operations ====================

    /// Insert or replace the context of a session
    pub fn save_context(&self, context: &FlowContext) -> DbResult<()> {
        let payload = serde_json::to_string(context)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO flow_contexts (user_id, session_id, tenant_id, flow_id, current_node_id, state, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, session_id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                flow_id = excluded.flow_id,
                current_node_id = excluded.current_node_id,
                state = excluded.state,
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![
                context.user_id,
                context.session_id,
                context.tenant_id,
                context.flow_id,
                context.current_node_id,
                context.state.name(),
                payload,
                context.created_at.to_rfc3339(),
                context.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load the context of a session, if one was saved
    pub fn load_context(&self, key: &SessionKey) -> DbResult<Option<FlowContext>> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM flow_contexts WHERE user_id = ?1 AND session_id = ?2",
                params![key.user_id, key.session_id],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|p| {
                serde_json::from_str(&p).map_err(|e| DbError::Corrupt {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Delete a session's context. Returns whether one existed.
    pub fn delete_context(&self, key: &SessionKey) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM flow_contexts WHERE user_id = ?1 AND session_id = ?2",
            params![key.user_id, key.session_id],
        )?;
        Ok(deleted > 0)
    }

    /// Sessions of a user, most recently active first
    pub fn list_sessions(&self, user_id: &str) -> DbResult<Vec<SessionSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT user_id, session_id, tenant_id, flow_id, current_node_id, state, created_at, updated_at
             FROM flow_contexts WHERE user_id = ?1 ORDER BY updated_at DESC",
        )?;

        let sessions = stmt
            .query_map(params![user_id], |row| {
                Ok(SessionSummary {
                    user_id: row.get(0)?,
                    session_id: row.get(1)?,
                    tenant_id: row.get(2)?,
                    flow_id: row.get(3)?,
                    current_node_id: row.get(4)?,
                    state: row.get(5)?,
                    created_at: parse_datetime(&row.get::<_, String>(6)?),
                    updated_at: parse_datetime(&row.get::<_, String>(7)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    // ==================== Lock Operations ====================

    /// Take `key` for `owner` unless an unexpired lease belongs to someone
    /// else. Re-acquiring an own lease extends it.
    pub fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> DbResult<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "INSERT INTO session_locks (lock_key, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(lock_key) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
             WHERE session_locks.expires_at <= ?4 OR session_locks.owner = excluded.owner",
            params![key, owner, expires_at, now],
        )?;
        Ok(changed > 0)
    }

    /// Drop the lease if `owner` still holds it
    pub fn release_lock(&self, key: &str, owner: &str) -> DbResult<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM session_locks WHERE lock_key = ?1 AND owner = ?2",
            params![key, owner],
        )?;
        Ok(deleted > 0)
    }

    /// Remove leases whose TTL has passed
    pub fn purge_expired_locks(&self) -> DbResult<usize> {
        let conn = self.conn.lock().unwrap();
        let purged = conn.execute(
            "DELETE FROM session_locks WHERE expires_at <= ?1",
            params![Utc::now().timestamp_millis()],
        )?;
        Ok(purged)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
