//! In-memory lock manager.

use super::{LockGrant, LockManager};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use relay_core::{DispatchError, DispatchResult};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

struct LockEntry {
    holder: String,
    token: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    locks: HashMap<String, LockEntry>,
    /// Per-key token counters. Never removed, so tokens stay monotonic
    /// across expiry and re-acquisition.
    tokens: HashMap<String, u64>,
}

/// In-memory implementation of [`LockManager`].
#[derive(Default)]
pub struct MemoryLockManager {
    inner: Mutex<Inner>,
}

impl MemoryLockManager {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lease_expiry(lease: Duration) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::from_std(lease).unwrap_or_default()
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> DispatchResult<LockGrant> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        if let Some(entry) = inner.locks.get(key) {
            if entry.expires_at > now {
                return Err(DispatchError::LockContention { key: key.into() });
            }
        }

        let token = {
            let counter = inner.tokens.entry(key.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        let expires_at = lease_expiry(lease);
        inner.locks.insert(
            key.to_string(),
            LockEntry {
                holder: holder.to_string(),
                token,
                expires_at,
            },
        );

        debug!(key = %key, holder = %holder, token, "Acquired lock");
        Ok(LockGrant {
            key: key.to_string(),
            holder: holder.to_string(),
            token,
            expires_at,
        })
    }

    async fn release(&self, key: &str, holder: &str, token: u64) -> DispatchResult<()> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let valid = inner
            .locks
            .get(key)
            .is_some_and(|e| e.holder == holder && e.token == token && e.expires_at > now);

        if !valid {
            return Err(DispatchError::Conflict(format!(
                "lock '{key}' not held by '{holder}' with token {token}"
            )));
        }

        inner.locks.remove(key);
        debug!(key = %key, holder = %holder, token, "Released lock");
        Ok(())
    }

    async fn renew(
        &self,
        key: &str,
        holder: &str,
        token: u64,
        lease: Duration,
    ) -> DispatchResult<LockGrant> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let Some(entry) = inner.locks.get_mut(key) else {
            return Err(DispatchError::Conflict(format!("lock '{key}' not held")));
        };
        if entry.holder != holder || entry.token != token || entry.expires_at <= now {
            return Err(DispatchError::Conflict(format!(
                "lock '{key}' not held by '{holder}' with token {token}"
            )));
        }

        entry.expires_at = lease_expiry(lease);
        let expires_at = entry.expires_at;
        debug!(key = %key, holder = %holder, token, "Renewed lock");
        Ok(LockGrant {
            key: key.to_string(),
            holder: holder.to_string(),
            token,
            expires_at,
        })
    }
}
