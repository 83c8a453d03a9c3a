//! Partition assignment and priority ordering score.

use relay_core::{Priority, TaskDescriptor};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Stride separating adjacent priority tiers in the composite score.
///
/// Millisecond timestamps stay below this value until 2096, so the tier
/// component always dominates the time component and the whole score stays
/// inside f64's exact integer range (needed for Redis sorted-set scores).
pub const TIER_STRIDE_MS: i64 = 4_000_000_000_000;

/// Composite ordering score: primary key = tier rank, secondary key =
/// enqueue time. Lower scores are claimed first, giving strict priority
/// ordering across tiers and FIFO within a tier.
#[must_use]
pub fn ordering_score(priority: Priority, enqueued_ms: i64) -> f64 {
    (i64::from(priority.rank()) * TIER_STRIDE_MS + enqueued_ms) as f64
}

/// Assigns tasks to partitions via a stable hash of the routing key.
///
/// The partition count is fixed cluster-wide; a task's partition is computed
/// once at submission and never changes, so retries route to the same shard.
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    partition_count: u32,
}

impl Partitioner {
    /// Creates a partitioner for a fixed partition count.
    #[must_use]
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count: partition_count.max(1),
        }
    }

    /// Number of partitions.
    #[must_use]
    pub const fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Partition for an arbitrary routing key.
    #[must_use]
    pub fn partition_for(&self, routing_key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        routing_key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partition_count)) as u32
    }

    /// Partition for a task descriptor, using its default routing key
    /// (category + worker kind) so related tasks share a shard.
    #[must_use]
    pub fn route(&self, descriptor: &TaskDescriptor) -> u32 {
        self.partition_for(&descriptor.routing_key())
    }
}
