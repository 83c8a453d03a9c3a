//! Specialized worker pools.
//!
//! One pool per worker kind. Each worker loop scans its assigned partitions
//! round-robin, promotes due retries, attempts an atomic claim, and hands
//! successful claims to the execution supervisor. An idle worker backs off
//! with a bounded exponential sleep instead of spinning.

use crate::supervisor::ExecutionSupervisor;
use relay_core::WorkerKind;
use relay_queue::QueueStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pool behaviour tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Smallest idle backoff sleep in milliseconds.
    #[serde(default = "default_idle_backoff_min")]
    pub idle_backoff_min_ms: u64,

    /// Largest idle backoff sleep in milliseconds.
    #[serde(default = "default_idle_backoff_max")]
    pub idle_backoff_max_ms: u64,

    /// How often the pool reconciles live workers against the target.
    #[serde(default = "default_spawn_check_interval")]
    pub spawn_check_interval_ms: u64,

    /// How long shutdown waits for in-flight work to drain.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_backoff_min_ms: default_idle_backoff_min(),
            idle_backoff_max_ms: default_idle_backoff_max(),
            spawn_check_interval_ms: default_spawn_check_interval(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

fn default_idle_backoff_min() -> u64 {
    20
}

fn default_idle_backoff_max() -> u64 {
    1000
}

fn default_spawn_check_interval() -> u64 {
    200
}

fn default_drain_timeout() -> u64 {
    30
}

impl PoolConfig {
    /// Returns the minimum idle backoff as a `Duration`.
    #[must_use]
    pub const fn idle_backoff_min(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_min_ms)
    }

    /// Returns the maximum idle backoff as a `Duration`.
    #[must_use]
    pub const fn idle_backoff_max(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_max_ms)
    }

    /// Returns the reconcile interval as a `Duration`.
    #[must_use]
    pub const fn spawn_check_interval(&self) -> Duration {
        Duration::from_millis(self.spawn_check_interval_ms)
    }

    /// Returns the drain timeout as a `Duration`.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Pool sizing bounds, scaled from the CPU count at startup and adjusted at
/// runtime by the autoscaler within `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizingPolicy {
    pub min: usize,
    pub max: usize,
    pub initial: usize,
}

impl SizingPolicy {
    /// Default sizing for a worker kind given the available CPU count.
    #[must_use]
    pub fn for_kind(kind: WorkerKind, cores: usize) -> Self {
        let cores = cores.max(1);
        match kind {
            WorkerKind::Cpu => Self {
                min: 1,
                max: cores * 2,
                initial: cores,
            },
            WorkerKind::Io => Self {
                min: 2,
                max: cores * 8,
                initial: cores * 4,
            },
            WorkerKind::Memory => Self {
                min: 1,
                max: cores,
                initial: (cores / 2).max(1),
            },
            WorkerKind::Network => Self {
                min: 2,
                max: cores * 8,
                initial: cores * 4,
            },
            WorkerKind::General => Self {
                min: 1,
                max: cores * 4,
                initial: cores * 2,
            },
        }
    }

    fn clamp(&self, target: usize) -> usize {
        target.clamp(self.min, self.max)
    }
}

/// Bounded exponential idle backoff: grows while no work is found, resets on
/// a successful claim.
struct IdleBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl IdleBackoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: min,
            min,
            max,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

/// A pool of workers for one worker kind.
pub struct WorkerPool {
    id: String,
    kind: WorkerKind,
    store: Arc<dyn QueueStore>,
    supervisor: Arc<ExecutionSupervisor>,
    partitions: Arc<Vec<u32>>,
    sizing: SizingPolicy,
    config: PoolConfig,
    target: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    busy: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Creates a pool responsible for every partition of its kind.
    pub fn new(
        kind: WorkerKind,
        store: Arc<dyn QueueStore>,
        supervisor: Arc<ExecutionSupervisor>,
        partition_count: u32,
        sizing: SizingPolicy,
        config: PoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            id: format!("pool-{}-{}", kind, Uuid::new_v4()),
            kind,
            store,
            supervisor,
            partitions: Arc::new((0..partition_count).collect()),
            sizing,
            config,
            target: Arc::new(AtomicUsize::new(sizing.initial)),
            live: Arc::new(AtomicUsize::new(0)),
            busy: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Worker kind served by this pool.
    #[must_use]
    pub const fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Pool id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sizing bounds.
    #[must_use]
    pub const fn sizing(&self) -> SizingPolicy {
        self.sizing
    }

    /// Current worker target.
    #[must_use]
    pub fn target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    /// Sets the worker target, clamped to the sizing bounds. Live workers
    /// converge on the new target at their next loop iteration.
    pub fn set_target(&self, target: usize) {
        let clamped = self.sizing.clamp(target);
        let previous = self.target.swap(clamped, Ordering::SeqCst);
        if previous != clamped {
            info!(
                pool = %self.kind,
                from = previous,
                to = clamped,
                "Adjusted worker target"
            );
        }
    }

    /// Live worker loops.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Workers currently executing a task.
    #[must_use]
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Runs the pool: keeps the live worker count reconciled against the
    /// target until shutdown, then drains.
    pub async fn run(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(pool = %self.kind, "Pool already running");
            return;
        }

        info!(
            pool = %self.kind,
            pool_id = %self.id,
            initial = self.sizing.initial,
            partitions = self.partitions.len(),
            "Starting worker pool"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut reconcile = tokio::time::interval(self.config.spawn_check_interval());

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(pool = %self.kind, "Received shutdown signal");
                    break;
                }
                _ = reconcile.tick() => {
                    while self.live.load(Ordering::SeqCst) < self.target.load(Ordering::SeqCst) {
                        self.live.fetch_add(1, Ordering::SeqCst);
                        Self::spawn_worker(self.clone());
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);

        // Drain: workers observe the shutdown flag and exit.
        let drain = async {
            while self.live.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(self.config.drain_timeout(), drain)
            .await
            .is_err()
        {
            warn!(pool = %self.kind, "Drain timeout elapsed with workers still live");
        }

        info!(pool = %self.kind, "Worker pool stopped");
    }

    /// Signals the pool to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_worker(pool: Arc<Self>) {
        let worker_id = format!("{}-worker-{}", pool.kind, Uuid::new_v4());

        tokio::spawn(async move {
            let mut backoff = IdleBackoff::new(
                pool.config.idle_backoff_min(),
                pool.config.idle_backoff_max(),
            );
            let mut shutdown_rx = pool.shutdown_tx.subscribe();
            let mut cursor = 0usize;

            debug!(worker_id = %worker_id, "Worker started");

            loop {
                if !pool.running.load(Ordering::SeqCst) {
                    pool.live.fetch_sub(1, Ordering::SeqCst);
                    break;
                }

                // Scale-down: excess workers exit one at a time.
                let live = pool.live.load(Ordering::SeqCst);
                if live > pool.target.load(Ordering::SeqCst) {
                    if pool
                        .live
                        .compare_exchange(live, live - 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        debug!(worker_id = %worker_id, "Worker exiting on scale-down");
                        break;
                    }
                    continue;
                }

                if pool.claim_one(&worker_id, &mut cursor).await {
                    backoff.reset();
                } else {
                    let delay = backoff.next();
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => {
                            pool.live.fetch_sub(1, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }

            debug!(worker_id = %worker_id, "Worker stopped");
        });
    }

    /// One scan over the pool's partitions: promote due retries, then try to
    /// claim. Returns true if a task was claimed and executed.
    async fn claim_one(&self, worker_id: &str, cursor: &mut usize) -> bool {
        let partitions = self.partitions.as_slice();
        if partitions.is_empty() {
            return false;
        }

        for offset in 0..partitions.len() {
            let partition = partitions[(*cursor + offset) % partitions.len()];

            if let Err(e) = self.store.promote_due(self.kind, partition).await {
                warn!(pool = %self.kind, partition, error = %e, "Failed to promote delayed tasks");
            }

            match self.store.claim(self.kind, partition, worker_id).await {
                Ok(Some(task)) => {
                    *cursor = (*cursor + offset) % partitions.len();
                    self.busy.fetch_add(1, Ordering::SeqCst);
                    if let Err(e) = self.supervisor.execute(task, worker_id).await {
                        error!(pool = %self.kind, error = %e, "Supervisor failed to record outcome");
                    }
                    self.busy.fetch_sub(1, Ordering::SeqCst);
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(pool = %self.kind, partition, error = %e, "Claim attempt failed");
                }
            }
        }

        *cursor = (*cursor + 1) % partitions.len();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_scales_with_cores() {
        let cpu = SizingPolicy::for_kind(WorkerKind::Cpu, 8);
        assert_eq!(cpu.initial, 8);

        let io = SizingPolicy::for_kind(WorkerKind::Io, 8);
        assert_eq!(io.initial, 32);
        assert!(io.max > cpu.max);

        let memory = SizingPolicy::for_kind(WorkerKind::Memory, 8);
        assert_eq!(memory.initial, 4);
    }

    #[test]
    fn sizing_never_drops_below_one() {
        for kind in WorkerKind::ALL {
            let sizing = SizingPolicy::for_kind(kind, 1);
            assert!(sizing.min >= 1);
            assert!(sizing.initial >= 1);
            assert!(sizing.max >= sizing.initial);
        }
    }

    #[test]
    fn clamp_respects_bounds() {
        let sizing = SizingPolicy {
            min: 2,
            max: 10,
            initial: 4,
        };
        assert_eq!(sizing.clamp(0), 2);
        assert_eq!(sizing.clamp(5), 5);
        assert_eq!(sizing.clamp(100), 10);
    }

    #[test]
    fn idle_backoff_grows_and_resets() {
        let mut backoff = IdleBackoff::new(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(backoff.next(), Duration::from_millis(10));
        assert_eq!(backoff.next(), Duration::from_millis(20));
        assert_eq!(backoff.next(), Duration::from_millis(40));
        // Bounded at the maximum.
        assert_eq!(backoff.next(), Duration::from_millis(50));
        assert_eq!(backoff.next(), Duration::from_millis(50));

        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(10));
    }

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert!(config.idle_backoff_min() < config.idle_backoff_max());
        assert!(config.drain_timeout() > Duration::ZERO);
    }
}
