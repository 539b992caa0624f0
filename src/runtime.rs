//! Runtime for driving conversations
//!
//! The [`TurnRunner`] owns the per-turn pipeline. Storage and locking sit
//! behind the traits in [`traits`] so deployments can bring their own
//! backends; [`DatabaseStorage`] implements both on SQLite.

pub mod result;
pub mod runner;
pub mod session;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use result::{ExecutedAction, InboundMessage, TurnDisposition, TurnMetadata, TurnResult};
pub use runner::{RuntimeError, TurnRunner, HANDOFF_NOTICE};
pub use session::{
    acquire_lock, InMemoryLockStore, LockLease, LockOutcome, LockPolicy, SessionSequencer,
    TurnTicket,
};
pub use traits::{ContextStore, DatabaseStorage, LockError, LockStore, StoreError};
