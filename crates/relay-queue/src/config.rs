//! Queue store configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the queue store and lock manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of partitions, fixed cluster-wide. Changing it requires a
    /// rebalance.
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,

    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Default retry policy applied when a task carries none.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Dead letter store configuration.
    #[serde(default)]
    pub dlq: DlqConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            redis: RedisConfig::default(),
            retry: RetryConfig::default(),
            dlq: DlqConfig::default(),
        }
    }
}

fn default_partition_count() -> u32 {
    16
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for all dispatcher keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "relay".to_string()
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds (backoff ceiling).
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0) applied to each delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    300_000 // 5 minutes
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

/// Dead letter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Maximum records retained per worker type; oldest evicted first.
    #[serde(default = "default_dlq_max_per_kind")]
    pub max_per_worker_kind: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_per_worker_kind: default_dlq_max_per_kind(),
        }
    }
}

fn default_dlq_max_per_kind() -> usize {
    10_000
}

impl RedisConfig {
    /// Returns the connect timeout as a `Duration`.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
