//! Compare-and-set locks with a time-to-live.
//!
//! The scheduler takes one of these around every tick so two ticks never claim the
//! same ready job. A lock is identified by its key and owned by whoever presented
//! the stored token; an expired lock may be taken over by any caller.

use crate::{
    Result,
    clock::{Clock, SharedClock},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::debug;

/// Storage contract for advisory locks.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key -> token` with `expires_at = now + ttl` unless an unexpired lock
    /// exists. Returns whether this caller now holds the lock.
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Clear the lock only if it is held by `token`. A mismatched token leaves the
    /// lock in place and returns `false`.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: DateTime<Utc>,
}

/// In-memory lock store; check-and-set runs under a single mutex.
#[derive(Debug, Clone)]
pub struct InMemoryLockStore {
    locks: Arc<Mutex<HashMap<String, LockEntry>>>,
    clock: SharedClock,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::with_shared_clock(crate::clock::system_clock())
    }

    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self::with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(clock: SharedClock) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Token of the unexpired holder of `key`, if any.
    pub async fn holder(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let locks = self.locks.lock().await;
        locks
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.token.clone())
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut locks = self.locks.lock().await;
        if let Some(existing) = locks.get(key) {
            if existing.expires_at > now {
                debug!(key, "Lock already held");
                return Ok(false);
            }
            debug!(key, "Taking over expired lock");
        }

        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(entry) if entry.token == token => {
                locks.remove(key);
                Ok(true)
            }
            Some(_) => {
                debug!(key, "Release ignored, lock held by another token");
                Ok(false)
            }
            None => Ok(false),
        }
    }
}
