//! # Relay Queue
//!
//! The partitioned, priority-ordered queue store behind the relay
//! dispatcher, plus the lease-based distributed lock manager.
//!
//! Tasks are indexed per `(worker_kind, partition)` in an ordered structure
//! whose score encodes the priority tier and enqueue time, so a single
//! atomic pop always yields the highest-priority, oldest task of that
//! partition. Ordering is partition-local by design; there is no global
//! cross-partition ordering.
//!
//! Two store backends share one trait: a Redis-backed store for clustered
//! deployments and an in-memory store for tests and single-node use.

pub mod config;
pub mod lock;
pub mod memory;
pub mod partition;
pub mod redis;
pub mod retry;
pub mod store;

pub use config::{DlqConfig, QueueConfig, RedisConfig, RetryConfig};
pub use lock::{LockGrant, LockManager, MemoryLockManager, RedisLockManager};
pub use memory::MemoryQueueStore;
pub use partition::{ordering_score, Partitioner, TIER_STRIDE_MS};
pub use redis::{create_pool, RedisKeys, RedisQueueStore};
pub use retry::{RetryPolicy, RetryStrategy};
pub use store::QueueStore;
