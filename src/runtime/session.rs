//! Per-session concurrency control
//!
//! Two mechanisms work together:
//!
//! - A distributed lock (any [`LockStore`]) held for the whole turn, so two
//!   engine instances never mutate the same context at once.
//! - A local [`SessionSequencer`] that numbers inbound messages per session.
//!   A newer message cancels the older turn's token; ordering is by sequence
//!   number, never by wall clock.

use super::traits::{LockError, LockStore};
use crate::context::SessionKey;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Distributed lock
// ============================================================================

/// How long to hold and how long to wait for a session lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub ttl: Duration,
    pub wait: Duration,
    pub retry_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            wait: Duration::from_secs(30),
            retry_interval: Duration::from_millis(100),
        }
    }
}

/// A held lock. Must be handed back with [`LockLease::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub owner: String,
}

impl LockLease {
    pub async fn release<K: LockStore + ?Sized>(&self, store: &K) {
        if let Err(e) = store.release(&self.key, &self.owner).await {
            // The TTL reclaims it eventually
            tracing::warn!(lock = %self.key, error = %e, "Failed to release session lock");
        }
    }
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(LockLease),
    /// Waited `policy.wait` without getting the lock
    TimedOut,
    /// The turn was superseded while waiting
    Cancelled,
}

/// Retry `try_acquire` until it succeeds, the wait budget runs out, or
/// `cancel` fires
pub async fn acquire_lock<K: LockStore + ?Sized>(
    store: &K,
    key: &str,
    policy: LockPolicy,
    cancel: &CancellationToken,
) -> Result<LockOutcome, LockError> {
    let owner = uuid::Uuid::new_v4().to_string();
    let deadline = Instant::now() + policy.wait;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Ok(LockOutcome::Cancelled);
        }
        attempts += 1;
        if store.try_acquire(key, &owner, policy.ttl).await? {
            if attempts > 1 {
                tracing::debug!(lock = %key, attempts, "Session lock acquired after contention");
            }
            return Ok(LockOutcome::Acquired(LockLease {
                key: key.to_string(),
                owner,
            }));
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(lock = %key, attempts, "Timed out waiting for session lock");
            return Ok(LockOutcome::TimedOut);
        }
        let pause = policy.retry_interval.min(deadline - now);
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(LockOutcome::Cancelled),
            () = tokio::time::sleep(pause) => {}
        }
    }
}

/// Process-local lock store, for tests and single-instance deployments
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, key: &str) -> Option<String> {
        let leases = self.leases.lock().unwrap();
        leases
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(owner, _)| owner.clone())
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();
        match leases.get(key) {
            Some((holder, expires)) if *expires > now && holder != owner => Ok(false),
            _ => {
                leases.insert(key.to_string(), (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let mut leases = self.leases.lock().unwrap();
        if leases.get(key).is_some_and(|(holder, _)| holder == owner) {
            leases.remove(key);
        }
        Ok(())
    }
}

// ============================================================================
// Sequencing
// ============================================================================

/// Admission of one inbound message
#[derive(Debug, Clone)]
pub struct TurnTicket {
    pub key: SessionKey,
    pub seq: u64,
    /// Cancelled when a newer message arrives for the same session
    pub cancel: CancellationToken,
    message_id: Option<String>,
}

impl TurnTicket {
    pub fn is_superseded(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Default)]
struct SessionSlot {
    latest: u64,
    current: Option<(u64, CancellationToken)>,
    in_flight: HashSet<String>,
    /// Texts of superseded turns, oldest first
    deferred: Vec<String>,
}

/// Numbers inbound messages per session and cancels stale turns
#[derive(Debug, Default)]
pub struct SessionSequencer {
    sessions: Mutex<HashMap<SessionKey, SessionSlot>>,
}

impl SessionSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a message. Returns `None` when a message with the same id is
    /// already in flight for this session.
    pub fn begin(&self, key: &SessionKey, message_id: Option<&str>) -> Option<TurnTicket> {
        let mut sessions = self.sessions.lock().unwrap();
        let slot = sessions.entry(key.clone()).or_default();

        if let Some(id) = message_id {
            if !slot.in_flight.insert(id.to_string()) {
                return None;
            }
        }

        slot.latest += 1;
        let seq = slot.latest;
        let cancel = CancellationToken::new();
        if let Some((older, token)) = slot.current.replace((seq, cancel.clone())) {
            tracing::debug!(session = %key, older, newer = seq, "Superseding in-flight turn");
            token.cancel();
        }

        Some(TurnTicket {
            key: key.clone(),
            seq,
            cancel,
            message_id: message_id.map(ToString::to_string),
        })
    }

    pub fn is_current(&self, ticket: &TurnTicket) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&ticket.key)
            .and_then(|slot| slot.current.as_ref())
            .is_some_and(|(seq, _)| *seq == ticket.seq)
    }

    /// Keep the text of a superseded turn for the next turn to pick up
    pub fn defer(&self, ticket: &TurnTicket, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(ticket.key.clone())
            .or_default()
            .deferred
            .push(text.to_string());
    }

    pub fn take_deferred(&self, key: &SessionKey) -> Vec<String> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .get_mut(key)
            .map(|slot| std::mem::take(&mut slot.deferred))
            .unwrap_or_default()
    }

    /// Retire a ticket. The session slot is dropped once idle.
    pub fn finish(&self, ticket: &TurnTicket) {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(slot) = sessions.get_mut(&ticket.key) else {
            return;
        };
        if let Some(id) = &ticket.message_id {
            slot.in_flight.remove(id);
        }
        if slot.current.as_ref().is_some_and(|(seq, _)| *seq == ticket.seq) {
            slot.current = None;
        }
        if slot.current.is_none() && slot.in_flight.is_empty() && slot.deferred.is_empty() {
            sessions.remove(&ticket.key);
        }
    }
}
