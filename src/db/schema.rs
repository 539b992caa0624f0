//! Database schema and row types

use chrono::{DateTime, Utc};
use serde::Serialize;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS flow_contexts (
    user_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL DEFAULT '',
    flow_id TEXT NOT NULL,
    current_node_id TEXT NOT NULL,
    state TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    PRIMARY KEY (user_id, session_id)
);

CREATE INDEX IF NOT EXISTS idx_flow_contexts_updated ON flow_contexts(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_flow_contexts_flow ON flow_contexts(flow_id);

CREATE TABLE IF NOT EXISTS session_locks (
    lock_key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    -- Unix epoch milliseconds
    expires_at INTEGER NOT NULL
);
";

/// Listing view of a stored conversation, without the payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub user_id: String,
    pub session_id: String,
    pub tenant_id: String,
    pub flow_id: String,
    pub current_node_id: String,
    /// `TurnState::name()` at the last save
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
