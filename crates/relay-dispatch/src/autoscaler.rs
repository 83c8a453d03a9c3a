//! Queue-depth driven autoscaler.
//!
//! Samples each pool's queue depth and utilization on an interval. Scale-up
//! requires the high-water mark to hold for a sustained run of samples;
//! scale-down requires a longer run of low-utilization samples, so the two
//! directions cannot oscillate against each other.

use crate::metrics::{DispatchMetrics, MetricsHub};
use crate::pool::WorkerPool;
use relay_queue::QueueStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Autoscaler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    /// Sampling interval in milliseconds.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// Queue depth above which a pool is considered under-provisioned.
    #[serde(default = "default_high_water_depth")]
    pub high_water_depth: u64,

    /// Utilization (busy / target) below which a pool is considered idle.
    #[serde(default = "default_low_utilization")]
    pub low_utilization: f64,

    /// Consecutive high-water samples required before scaling up.
    #[serde(default = "default_scale_up_samples")]
    pub scale_up_samples: u32,

    /// Consecutive idle samples required before scaling down. Kept longer
    /// than the scale-up window to avoid oscillation.
    #[serde(default = "default_scale_down_samples")]
    pub scale_down_samples: u32,

    /// Workers added or removed per scaling step.
    #[serde(default = "default_scale_step")]
    pub scale_step: usize,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval(),
            high_water_depth: default_high_water_depth(),
            low_utilization: default_low_utilization(),
            scale_up_samples: default_scale_up_samples(),
            scale_down_samples: default_scale_down_samples(),
            scale_step: default_scale_step(),
        }
    }
}

fn default_sample_interval() -> u64 {
    1000
}

fn default_high_water_depth() -> u64 {
    100
}

fn default_low_utilization() -> f64 {
    0.2
}

fn default_scale_up_samples() -> u32 {
    3
}

fn default_scale_down_samples() -> u32 {
    15
}

fn default_scale_step() -> usize {
    2
}

impl AutoscalerConfig {
    /// Returns the sampling interval as a `Duration`.
    #[must_use]
    pub const fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Per-pool streak counters.
#[derive(Default)]
struct Streaks {
    high: u32,
    idle: u32,
}

/// Adjusts pool targets from sampled queue depth and utilization.
pub struct Autoscaler {
    pools: Vec<Arc<WorkerPool>>,
    store: Arc<dyn QueueStore>,
    partition_count: u32,
    config: AutoscalerConfig,
    metrics: Arc<MetricsHub>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Autoscaler {
    /// Creates an autoscaler over the given pools.
    pub fn new(
        pools: Vec<Arc<WorkerPool>>,
        store: Arc<dyn QueueStore>,
        partition_count: u32,
        config: AutoscalerConfig,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            pools,
            store,
            partition_count,
            config,
            metrics,
            shutdown_tx,
        }
    }

    /// Runs the sampling loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_ms = self.config.sample_interval_ms,
            high_water = self.config.high_water_depth,
            "Starting autoscaler"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = tokio::time::interval(self.config.sample_interval());
        let mut streaks: HashMap<relay_core::WorkerKind, Streaks> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Autoscaler received shutdown signal");
                    break;
                }
                _ = tick.tick() => {
                    self.sample(&mut streaks).await;
                }
            }
        }
    }

    /// Signals the autoscaler to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn sample(&self, streaks: &mut HashMap<relay_core::WorkerKind, Streaks>) {
        for pool in &self.pools {
            let kind = pool.kind();

            let mut depth = 0u64;
            let mut reachable = true;
            for partition in 0..self.partition_count {
                match self.store.depth(kind, partition).await {
                    Ok(d) => depth += d,
                    Err(e) => {
                        warn!(pool = %kind, partition, error = %e, "Depth sample failed");
                        reachable = false;
                        break;
                    }
                }
            }
            if !reachable {
                continue;
            }

            let target = pool.target();
            let busy = pool.busy();
            let utilization = if target == 0 {
                0.0
            } else {
                busy as f64 / target as f64
            };

            let sizing = pool.sizing();
            self.metrics
                .update_pool_state(kind, depth, busy, target, sizing.min, sizing.max);
            DispatchMetrics::update_pool(kind, depth, busy, target);

            let entry = streaks.entry(kind).or_default();

            if depth > self.config.high_water_depth {
                entry.high += 1;
                entry.idle = 0;
                if entry.high >= self.config.scale_up_samples {
                    pool.set_target(target + self.config.scale_step);
                    entry.high = 0;
                }
            } else if utilization < self.config.low_utilization && depth == 0 {
                entry.idle += 1;
                entry.high = 0;
                if entry.idle >= self.config.scale_down_samples {
                    pool.set_target(target.saturating_sub(self.config.scale_step));
                    entry.idle = 0;
                }
            } else {
                entry.high = 0;
                entry.idle = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsHub;
    use crate::pool::{PoolConfig, SizingPolicy, WorkerPool};
    use crate::registry::FunctionRegistry;
    use crate::supervisor::{CancellationRegistry, ExecutionSupervisor};
    use relay_core::{Priority, TaskDescriptor, TaskRecord, WorkerKind};
    use relay_queue::{MemoryQueueStore, RetryPolicy};
    use relay_resilience::{BreakerRegistry, CircuitBreakerConfig};

    fn fixture() -> (Arc<MemoryQueueStore>, Arc<WorkerPool>, Arc<Autoscaler>) {
        let store = Arc::new(MemoryQueueStore::new(100));
        let registry = Arc::new(FunctionRegistry::new());
        let metrics = Arc::new(MetricsHub::new());
        let supervisor = Arc::new(ExecutionSupervisor::new(
            registry,
            store.clone(),
            Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(CancellationRegistry::new()),
            RetryPolicy::immediate(),
            metrics.clone(),
        ));

        let pool = Arc::new(WorkerPool::new(
            WorkerKind::Io,
            store.clone(),
            supervisor,
            2,
            SizingPolicy {
                min: 1,
                max: 10,
                initial: 2,
            },
            PoolConfig::default(),
        ));

        let autoscaler = Arc::new(Autoscaler::new(
            vec![pool.clone()],
            store.clone(),
            2,
            AutoscalerConfig {
                high_water_depth: 5,
                scale_up_samples: 2,
                scale_down_samples: 3,
                scale_step: 2,
                ..Default::default()
            },
            metrics,
        ));

        (store, pool, autoscaler)
    }

    async fn flood(store: &MemoryQueueStore, n: usize) {
        for _ in 0..n {
            let descriptor = TaskDescriptor {
                name: "t".into(),
                function: "f".into(),
                payload: Default::default(),
                priority: Priority::Normal,
                worker_kind: WorkerKind::Io,
                category: "c".into(),
                timeout_secs: 5,
                max_retries: 1,
                metadata: Default::default(),
            };
            store
                .enqueue(&TaskRecord::from_descriptor(descriptor, 0))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn sustained_high_water_scales_up() {
        let (store, pool, autoscaler) = fixture();
        flood(&store, 20).await;

        let mut streaks = HashMap::new();
        autoscaler.sample(&mut streaks).await;
        assert_eq!(pool.target(), 2); // one sample is not sustained
        autoscaler.sample(&mut streaks).await;
        assert_eq!(pool.target(), 4);
    }

    #[tokio::test]
    async fn sustained_idle_scales_down_with_longer_window() {
        let (_store, pool, autoscaler) = fixture();
        pool.set_target(6);

        let mut streaks = HashMap::new();
        autoscaler.sample(&mut streaks).await;
        autoscaler.sample(&mut streaks).await;
        assert_eq!(pool.target(), 6); // below the scale-down window
        autoscaler.sample(&mut streaks).await;
        assert_eq!(pool.target(), 4);
    }

    #[tokio::test]
    async fn targets_stay_within_sizing_bounds() {
        let (store, pool, autoscaler) = fixture();
        flood(&store, 50).await;

        let mut streaks = HashMap::new();
        for _ in 0..50 {
            autoscaler.sample(&mut streaks).await;
        }
        assert!(pool.target() <= 10);
    }
}
