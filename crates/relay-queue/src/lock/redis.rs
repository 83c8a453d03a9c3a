//! Redis lock manager.
//!
//! Acquire is `INCR` (fencing token) followed by `SET NX PX` on the lock
//! key; the lease expires server-side, so a crashed holder never blocks the
//! key. Release and renew are Lua compare-and-act scripts: the stored value
//! is `holder:token`, and only a caller presenting the currently valid pair
//! can delete or extend the lease.

use super::{LockGrant, LockManager};
use crate::redis::RedisKeys;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use relay_core::{DispatchError, DispatchResult};
use std::fmt::Display;
use std::time::Duration;
use tracing::debug;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

const RENEW_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("pexpire", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

fn unavailable(e: impl Display) -> DispatchError {
    DispatchError::QueueUnavailable(e.to_string())
}

/// Redis-backed implementation of [`LockManager`].
pub struct RedisLockManager {
    pool: Pool,
    keys: RedisKeys,
}

impl RedisLockManager {
    /// Create a new Redis lock manager.
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
        }
    }

    async fn conn(&self) -> DispatchResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(unavailable)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(
        &self,
        key: &str,
        holder: &str,
        lease: Duration,
    ) -> DispatchResult<LockGrant> {
        let mut conn = self.conn().await?;

        // The token counter outlives the lock key, so tokens stay monotonic
        // across expiry and re-acquisition.
        let token: u64 = conn
            .incr(self.keys.lock_token(key), 1u64)
            .await
            .map_err(unavailable)?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.lock(key))
            .arg(format!("{holder}:{token}"))
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;

        if acquired.is_none() {
            return Err(DispatchError::LockContention { key: key.into() });
        }

        debug!(key = %key, holder = %holder, token, "Acquired lock");
        Ok(LockGrant {
            key: key.to_string(),
            holder: holder.to_string(),
            token,
            expires_at: Utc::now() + ChronoDuration::from_std(lease).unwrap_or_default(),
        })
    }

    async fn release(&self, key: &str, holder: &str, token: u64) -> DispatchResult<()> {
        let mut conn = self.conn().await?;

        let released: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.keys.lock(key))
            .arg(format!("{holder}:{token}"))
            .invoke_async(&mut *conn)
            .await
            .map_err(unavailable)?;

        if released == 0 {
            return Err(DispatchError::Conflict(format!(
                "lock '{key}' not held by '{holder}' with token {token}"
            )));
        }

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
        let mut conn = self.conn().await?;

        let renewed: i32 = redis::Script::new(RENEW_SCRIPT)
            .key(self.keys.lock(key))
            .arg(format!("{holder}:{token}"))
            .arg(lease.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await
            .map_err(unavailable)?;

        if renewed == 0 {
            return Err(DispatchError::Conflict(format!(
                "lock '{key}' not held by '{holder}' with token {token}"
            )));
        }

        debug!(key = %key, holder = %holder, token, "Renewed lock");
        Ok(LockGrant {
            key: key.to_string(),
            holder: holder.to_string(),
            token,
            expires_at: Utc::now() + ChronoDuration::from_std(lease).unwrap_or_default(),
        })
    }
}
