//! Lease-based distributed lock manager with fencing tokens.
//!
//! Lets workers coordinate exclusive access to shared external resources
//! (e.g. a downstream API that tolerates one caller at a time). Not used for
//! task claiming, which relies on the queue store's atomic pop.
//!
//! Every lock is a lease: it expires on its own, so a crashed holder can
//! never wedge the system. Each successful acquire issues a fencing token
//! strictly greater than any token previously issued for that key; releases
//! and renewals presenting a superseded token fail without disturbing the
//! current holder.

mod memory;
mod redis;

pub use memory::MemoryLockManager;
pub use redis::RedisLockManager;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::DispatchResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A granted lock lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    /// Lock key.
    pub key: String,

    /// Holder identity.
    pub holder: String,

    /// Fencing token, monotonically increasing per key.
    pub token: u64,

    /// Lease expiry.
    pub expires_at: DateTime<Utc>,
}

/// Distributed lock manager.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquires the lock if no unexpired lease exists for `key`.
    ///
    /// Fails with `LockContention` while another holder's lease is active.
    async fn acquire(&self, key: &str, holder: &str, lease: Duration)
        -> DispatchResult<LockGrant>;

    /// Releases the lock, but only for the currently valid (holder, token)
    /// pair. A stale or expired token yields `Conflict` and leaves the
    /// current holder's lock untouched.
    async fn release(&self, key: &str, holder: &str, token: u64) -> DispatchResult<()>;

    /// Extends the lease for the current valid holder. The fencing token is
    /// unchanged.
    async fn renew(
        &self,
        key: &str,
        holder: &str,
        token: u64,
        lease: Duration,
    ) -> DispatchResult<LockGrant>;
}
