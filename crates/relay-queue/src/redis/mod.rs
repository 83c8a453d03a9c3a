//! Redis-backed queue store and lock keys.

mod store;

pub use store::RedisQueueStore;

use crate::config::RedisConfig;
use deadpool_redis::{Config, Pool, Runtime};
use relay_core::{DispatchError, DispatchResult, WorkerKind};
use tracing::info;

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> DispatchResult<Pool> {
    info!("Creating Redis connection pool for queue store...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| DispatchError::Internal(format!("Invalid Redis config: {e}")))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| DispatchError::Internal(format!("Failed to create pool: {e}")))?;

    // Test connection
    let mut conn = pool
        .get()
        .await
        .map_err(|e| DispatchError::QueueUnavailable(e.to_string()))?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await
        .map_err(|e| DispatchError::QueueUnavailable(e.to_string()))?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for the dispatcher.
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Claimable index per (worker kind, partition): sorted set of
    /// (score, task id).
    pub fn queue(&self, kind: WorkerKind, partition: u32) -> String {
        format!("{}:queue:{}:{}", self.prefix, kind, partition)
    }

    /// Delayed set per (worker kind, partition): sorted set by due time.
    pub fn delayed(&self, kind: WorkerKind, partition: u32) -> String {
        format!("{}:delayed:{}:{}", self.prefix, kind, partition)
    }

    /// Task record key.
    pub fn task(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.prefix, task_id)
    }

    /// Dead-letter index per worker kind: sorted set by dead-letter time.
    pub fn dlq(&self, kind: WorkerKind) -> String {
        format!("{}:dlq:{}", self.prefix, kind)
    }

    /// Dead-letter record key.
    pub fn dlq_record(&self, dlq_id: &str) -> String {
        format!("{}:dlq:record:{}", self.prefix, dlq_id)
    }

    /// Lock key.
    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }

    /// Per-lock fencing token counter.
    pub fn lock_token(&self, name: &str) -> String {
        format!("{}:lock:token:{}", self.prefix, name)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("relay")
    }
}
