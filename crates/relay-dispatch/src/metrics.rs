//! Dispatcher metrics.
//!
//! Two layers, following the same split the rest of the engine uses: the
//! `metrics` facade exports counters/gauges/histograms to whatever recorder
//! the host installs, and [`MetricsHub`] keeps an in-process aggregate that
//! backs the `get_metrics()` API surface and the autoscaler's decisions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use parking_lot::RwLock;
use relay_core::WorkerKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Metric names for the dispatcher.
pub mod names {
    /// Total tasks submitted.
    pub const TASKS_SUBMITTED_TOTAL: &str = "relay_tasks_submitted_total";
    /// Total submissions rejected at admission.
    pub const TASKS_REJECTED_TOTAL: &str = "relay_tasks_rejected_total";
    /// Total tasks completed successfully.
    pub const TASKS_COMPLETED_TOTAL: &str = "relay_tasks_completed_total";
    /// Total task attempts that failed.
    pub const TASKS_FAILED_TOTAL: &str = "relay_tasks_failed_total";
    /// Total task attempts that timed out.
    pub const TASKS_TIMED_OUT_TOTAL: &str = "relay_tasks_timed_out_total";
    /// Total retries scheduled.
    pub const TASKS_RETRIED_TOTAL: &str = "relay_tasks_retried_total";
    /// Total tasks dead-lettered.
    pub const TASKS_DEAD_LETTERED_TOTAL: &str = "relay_tasks_dead_lettered_total";
    /// Total tasks cancelled.
    pub const TASKS_CANCELLED_TOTAL: &str = "relay_tasks_cancelled_total";
    /// Total dead-letter records replayed.
    pub const TASKS_REPLAYED_TOTAL: &str = "relay_tasks_replayed_total";

    /// Current queue depth per pool.
    pub const QUEUE_DEPTH: &str = "relay_queue_depth";
    /// Current worker target per pool.
    pub const POOL_TARGET: &str = "relay_pool_target";
    /// Workers currently executing per pool.
    pub const POOL_BUSY: &str = "relay_pool_busy";

    /// Task execution duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "relay_task_duration_seconds";
    /// Time from submission to first claim in seconds.
    pub const TASK_WAIT_SECONDS: &str = "relay_task_wait_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::TASKS_SUBMITTED_TOTAL, "Total number of tasks submitted");
    describe_counter!(
        names::TASKS_REJECTED_TOTAL,
        "Total number of submissions rejected at admission"
    );
    describe_counter!(
        names::TASKS_COMPLETED_TOTAL,
        "Total number of tasks completed successfully"
    );
    describe_counter!(names::TASKS_FAILED_TOTAL, "Total number of failed task attempts");
    describe_counter!(
        names::TASKS_TIMED_OUT_TOTAL,
        "Total number of task attempts stopped by the watchdog"
    );
    describe_counter!(names::TASKS_RETRIED_TOTAL, "Total number of retries scheduled");
    describe_counter!(
        names::TASKS_DEAD_LETTERED_TOTAL,
        "Total number of tasks moved to the dead letter store"
    );
    describe_counter!(names::TASKS_CANCELLED_TOTAL, "Total number of tasks cancelled");
    describe_counter!(
        names::TASKS_REPLAYED_TOTAL,
        "Total number of dead-letter records replayed"
    );

    describe_gauge!(names::QUEUE_DEPTH, "Current claimable tasks per pool");
    describe_gauge!(names::POOL_TARGET, "Current worker target per pool");
    describe_gauge!(names::POOL_BUSY, "Workers currently executing per pool");

    describe_histogram!(
        names::TASK_DURATION_SECONDS,
        "Task execution duration in seconds"
    );
    describe_histogram!(
        names::TASK_WAIT_SECONDS,
        "Time from submission to first claim in seconds"
    );
}

/// Facade-level metrics recorder.
#[derive(Clone)]
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record a task submitted.
    pub fn task_submitted(kind: WorkerKind, category: &str, priority: &str) {
        counter!(
            names::TASKS_SUBMITTED_TOTAL,
            "pool" => kind.as_str(),
            "category" => category.to_string(),
            "priority" => priority.to_string()
        )
        .increment(1);
    }

    /// Record a submission rejected at admission.
    pub fn task_rejected(category: &str, reason: &'static str) {
        counter!(
            names::TASKS_REJECTED_TOTAL,
            "category" => category.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record a completed task.
    pub fn task_completed(kind: WorkerKind, category: &str, duration: Duration) {
        counter!(
            names::TASKS_COMPLETED_TOTAL,
            "pool" => kind.as_str(),
            "category" => category.to_string()
        )
        .increment(1);

        histogram!(
            names::TASK_DURATION_SECONDS,
            "pool" => kind.as_str(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt.
    pub fn task_failed(kind: WorkerKind, category: &str, timed_out: bool, duration: Duration) {
        let name = if timed_out {
            names::TASKS_TIMED_OUT_TOTAL
        } else {
            names::TASKS_FAILED_TOTAL
        };
        counter!(
            name,
            "pool" => kind.as_str(),
            "category" => category.to_string()
        )
        .increment(1);

        histogram!(
            names::TASK_DURATION_SECONDS,
            "pool" => kind.as_str(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a retry scheduled.
    pub fn task_retried(kind: WorkerKind, attempt: u32) {
        counter!(
            names::TASKS_RETRIED_TOTAL,
            "pool" => kind.as_str(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a dead-lettered task.
    pub fn task_dead_lettered(kind: WorkerKind, category: &str) {
        counter!(
            names::TASKS_DEAD_LETTERED_TOTAL,
            "pool" => kind.as_str(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    /// Record a cancelled task.
    pub fn task_cancelled(kind: WorkerKind) {
        counter!(names::TASKS_CANCELLED_TOTAL, "pool" => kind.as_str()).increment(1);
    }

    /// Record a replayed dead-letter record.
    pub fn task_replayed(kind: WorkerKind) {
        counter!(names::TASKS_REPLAYED_TOTAL, "pool" => kind.as_str()).increment(1);
    }

    /// Record time from submission to first claim.
    pub fn task_wait(kind: WorkerKind, wait: Duration) {
        histogram!(names::TASK_WAIT_SECONDS, "pool" => kind.as_str()).record(wait.as_secs_f64());
    }

    /// Update pool gauges.
    pub fn update_pool(kind: WorkerKind, depth: u64, busy: usize, target: usize) {
        gauge!(names::QUEUE_DEPTH, "pool" => kind.as_str()).set(depth as f64);
        gauge!(names::POOL_BUSY, "pool" => kind.as_str()).set(busy as f64);
        gauge!(names::POOL_TARGET, "pool" => kind.as_str()).set(target as f64);
    }
}

/// Per-pool state, maintained by the autoscaler's sampling loop and the
/// supervisor's outcome reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub min_size: usize,
    pub max_size: usize,
    pub target_size: usize,
    pub busy_workers: usize,
    pub queue_depth: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
    /// Rolling (exponentially weighted) average execution time.
    pub avg_exec_ms: f64,
}

/// Per-category admission and outcome counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategorySnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl CategorySnapshot {
    /// Failed share of finished executions.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.failed as f64 / finished as f64
        }
    }
}

/// Aggregate snapshot returned by the metrics API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub pools: HashMap<WorkerKind, PoolSnapshot>,
    pub categories: HashMap<String, CategorySnapshot>,
}

/// In-process metrics aggregation.
///
/// Owned by the engine and shared by handle; there is no global recorder
/// state here.
#[derive(Default)]
pub struct MetricsHub {
    pools: RwLock<HashMap<WorkerKind, PoolSnapshot>>,
    categories: RwLock<HashMap<String, CategorySnapshot>>,
}

impl MetricsHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission.
    pub fn record_submitted(&self, category: &str) {
        self.categories
            .write()
            .entry(category.to_string())
            .or_default()
            .submitted += 1;
    }

    /// Record an admission rejection.
    pub fn record_rejected(&self, category: &str) {
        self.categories
            .write()
            .entry(category.to_string())
            .or_default()
            .rejected += 1;
    }

    /// Record a completed execution and fold its duration into the rolling
    /// average.
    pub fn record_completed(&self, kind: WorkerKind, category: &str, duration: Duration) {
        {
            let mut pools = self.pools.write();
            let pool = pools.entry(kind).or_default();
            pool.completed += 1;
            let ms = duration.as_secs_f64() * 1000.0;
            pool.avg_exec_ms = if pool.avg_exec_ms == 0.0 {
                ms
            } else {
                pool.avg_exec_ms * 0.8 + ms * 0.2
            };
        }
        self.categories
            .write()
            .entry(category.to_string())
            .or_default()
            .completed += 1;
    }

    /// Record a failed attempt.
    pub fn record_failed(&self, kind: WorkerKind, category: &str) {
        self.pools.write().entry(kind).or_default().failed += 1;
        self.categories
            .write()
            .entry(category.to_string())
            .or_default()
            .failed += 1;
    }

    /// Record a retry.
    pub fn record_retried(&self, kind: WorkerKind) {
        self.pools.write().entry(kind).or_default().retried += 1;
    }

    /// Record a dead-lettered task.
    pub fn record_dead_lettered(&self, kind: WorkerKind) {
        self.pools.write().entry(kind).or_default().dead_lettered += 1;
    }

    /// Record a cancelled task.
    pub fn record_cancelled(&self, kind: WorkerKind) {
        self.pools.write().entry(kind).or_default().cancelled += 1;
    }

    /// Update a pool's sampled state.
    pub fn update_pool_state(
        &self,
        kind: WorkerKind,
        queue_depth: u64,
        busy: usize,
        target: usize,
        min: usize,
        max: usize,
    ) {
        let mut pools = self.pools.write();
        let pool = pools.entry(kind).or_default();
        pool.queue_depth = queue_depth;
        pool.busy_workers = busy;
        pool.target_size = target;
        pool.min_size = min;
        pool.max_size = max;
    }

    /// Rolling average execution time for a pool.
    #[must_use]
    pub fn avg_exec(&self, kind: WorkerKind) -> Duration {
        let ms = self
            .pools
            .read()
            .get(&kind)
            .map(|p| p.avg_exec_ms)
            .unwrap_or(0.0);
        Duration::from_secs_f64(ms / 1000.0)
    }

    /// Current aggregate snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pools: self.pools.read().clone(),
            categories: self.categories.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_does_not_panic() {
        register_metrics();
    }

    #[test]
    fn hub_tracks_category_error_rate() {
        let hub = MetricsHub::new();
        hub.record_submitted("ocr");
        hub.record_completed(WorkerKind::Cpu, "ocr", Duration::from_millis(100));
        hub.record_failed(WorkerKind::Cpu, "ocr");

        let snapshot = hub.snapshot();
        let ocr = snapshot.categories.get("ocr").unwrap();
        assert_eq!(ocr.submitted, 1);
        assert!((ocr.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn rolling_average_moves_toward_new_samples() {
        let hub = MetricsHub::new();
        hub.record_completed(WorkerKind::Io, "c", Duration::from_millis(100));
        assert!((hub.avg_exec(WorkerKind::Io).as_millis() as i64 - 100).abs() <= 1);

        hub.record_completed(WorkerKind::Io, "c", Duration::from_millis(200));
        let avg = hub.avg_exec(WorkerKind::Io).as_millis() as i64;
        assert!(avg > 100 && avg < 200);
    }

    #[test]
    fn pool_state_updates_are_visible_in_snapshot() {
        let hub = MetricsHub::new();
        hub.update_pool_state(WorkerKind::Network, 42, 3, 8, 2, 16);

        let snapshot = hub.snapshot();
        let pool = snapshot.pools.get(&WorkerKind::Network).unwrap();
        assert_eq!(pool.queue_depth, 42);
        assert_eq!(pool.busy_workers, 3);
        assert_eq!(pool.target_size, 8);
    }
}
