//! Trait abstractions for runtime I/O
//!
//! The runner depends on these shapes only, so tests can swap in memory
//! implementations and deployments can bring their own stores.

use crate::context::{FlowContext, SessionKey};
use crate::db::{Database, DbError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend failed: {0}")]
    Backend(String),

    /// The stored record exists but is not a valid `FlowContext`
    #[error("Stored context for {key} is corrupt: {message}")]
    Corrupt { key: String, message: String },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock backend failed: {0}")]
    Backend(String),
}

/// Persistence for conversation contexts, scoped per session
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn load(&self, key: &SessionKey) -> Result<Option<FlowContext>, StoreError>;

    async fn save(&self, context: &FlowContext) -> Result<(), StoreError>;
}

/// A TTL-bounded mutual-exclusion store shared by every engine instance
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take `key` for `owner` unless someone else holds an unexpired lease.
    /// Expired leases are reclaimed.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Drop the lease if `owner` still holds it
    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError>;
}

// ============================================================================
// SQLite implementation
// ============================================================================

/// Both stores on one [`Database`]
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn inner(&self) -> &Database {
        &self.db
    }
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Corrupt { key, message } => StoreError::Corrupt { key, message },
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[async_trait]
impl ContextStore for DatabaseStorage {
    async fn load(&self, key: &SessionKey) -> Result<Option<FlowContext>, StoreError> {
        Ok(self.db.load_context(key)?)
    }

    async fn save(&self, context: &FlowContext) -> Result<(), StoreError> {
        Ok(self.db.save_context(context)?)
    }
}

#[async_trait]
impl LockStore for DatabaseStorage {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        self.db
            .try_acquire_lock(key, owner, ttl)
            .map_err(|e| LockError::Backend(e.to_string()))
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        self.db
            .release_lock(key, owner)
            .map(|_| ())
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ContextStore + ?Sized> ContextStore for Arc<T> {
    async fn load(&self, key: &SessionKey) -> Result<Option<FlowContext>, StoreError> {
        (**self).load(key).await
    }

    async fn save(&self, context: &FlowContext) -> Result<(), StoreError> {
        (**self).save(context).await
    }
}

#[async_trait]
impl<T: LockStore + ?Sized> LockStore for Arc<T> {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        (**self).try_acquire(key, owner, ttl).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        (**self).release(key, owner).await
    }
}
