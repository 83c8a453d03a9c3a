//! Execution supervisor.
//!
//! Owns the per-task lifecycle after a claim: watchdog timeout, cooperative
//! cancellation, retry backoff, and terminal-state recording. Task records
//! are mutated only here once a claim succeeds.

use crate::metrics::{DispatchMetrics, MetricsHub};
use crate::registry::{FunctionContext, FunctionRegistry};
use parking_lot::Mutex;
use relay_core::{DispatchError, DispatchResult, DeadLetterRecord, TaskId, TaskRecord, TaskStatus};
use relay_queue::{QueueStore, RetryPolicy};
use relay_resilience::BreakerRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;
use tracing::{debug, warn};

/// In-process cancellation flags for running tasks.
///
/// The cancel API flips the flag for a task running in this process; the
/// function observes it through its context at its own checkpoints.
#[derive(Default)]
pub struct CancellationRegistry {
    flags: Mutex<HashMap<TaskId, Arc<AtomicBool>>>,
}

impl CancellationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, task_id: TaskId) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.lock().insert(task_id, flag.clone());
        flag
    }

    fn remove(&self, task_id: &TaskId) {
        self.flags.lock().remove(task_id);
    }

    /// Requests cancellation of a task running in this process. Returns
    /// true if the task was found.
    pub fn request(&self, task_id: &TaskId) -> bool {
        match self.flags.lock().get(task_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Execution supervisor: runs one claimed task through to a recorded
/// outcome.
pub struct ExecutionSupervisor {
    registry: Arc<FunctionRegistry>,
    store: Arc<dyn QueueStore>,
    breakers: Arc<BreakerRegistry>,
    cancellations: Arc<CancellationRegistry>,
    retry_policy: RetryPolicy,
    metrics: Arc<MetricsHub>,
}

impl ExecutionSupervisor {
    /// Creates a supervisor.
    pub fn new(
        registry: Arc<FunctionRegistry>,
        store: Arc<dyn QueueStore>,
        breakers: Arc<BreakerRegistry>,
        cancellations: Arc<CancellationRegistry>,
        retry_policy: RetryPolicy,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        Self {
            registry,
            store,
            breakers,
            cancellations,
            retry_policy,
            metrics,
        }
    }

    /// Executes a claimed task: invoke the function under a watchdog, then
    /// record completion, retry, dead-letter or cancellation.
    pub async fn execute(&self, mut task: TaskRecord, worker_id: &str) -> DispatchResult<()> {
        let started = Instant::now();

        if task.retry_count == 0 {
            if let Some(started_at) = task.started_at {
                let wait = (started_at - task.created_at)
                    .to_std()
                    .unwrap_or_default();
                DispatchMetrics::task_wait(task.worker_kind, wait);
            }
        }

        let flag = self.cancellations.register(task.id);
        if task.cancel_requested {
            flag.store(true, Ordering::SeqCst);
        }

        let outcome = match self.registry.get(&task.function) {
            Some(handler) => {
                let ctx = FunctionContext::new(&task, worker_id, flag.clone());
                let attempt = handler(ctx);
                // Supervisor-side watchdog: the deadline fires even if the
                // handler never yields a result.
                tokio::select! {
                    result = attempt => result,
                    () = tokio::time::sleep(task.timeout()) => {
                        Err(DispatchError::Timeout(task.timeout_secs))
                    }
                }
            }
            // Validated at submission; only a registry change mid-flight
            // lands here.
            None => Err(DispatchError::Execution(format!(
                "no handler registered for function '{}'",
                task.function
            ))),
        };

        self.cancellations.remove(&task.id);

        // Merge cancellation requested from other processes via the store.
        let cancel_requested = flag.load(Ordering::SeqCst)
            || self
                .store
                .get(&task.id)
                .await?
                .is_some_and(|t| t.cancel_requested);

        if cancel_requested {
            // The attempt may have finished anyway; its result is discarded.
            task.transition(TaskStatus::Cancelled)?;
            task.completed_at = Some(Utc::now());
            task.result = None;
            self.store.update(&task).await?;
            self.metrics.record_cancelled(task.worker_kind);
            DispatchMetrics::task_cancelled(task.worker_kind);
            debug!(task_id = %task.id, "Task cancelled cooperatively");
            return Ok(());
        }

        match outcome {
            Ok(result) => {
                task.transition(TaskStatus::Completed)?;
                task.completed_at = Some(Utc::now());
                task.result = Some(result);
                self.store.update(&task).await?;

                self.breakers.record(&task.category, true).await;
                self.metrics
                    .record_completed(task.worker_kind, &task.category, started.elapsed());
                DispatchMetrics::task_completed(task.worker_kind, &task.category, started.elapsed());
                debug!(task_id = %task.id, "Task completed");
                Ok(())
            }
            Err(error) => self.handle_failure(task, error, started).await,
        }
    }

    async fn handle_failure(
        &self,
        mut task: TaskRecord,
        error: DispatchError,
        started: Instant,
    ) -> DispatchResult<()> {
        let timed_out = matches!(error, DispatchError::Timeout(_));
        task.set_error(&error);
        task.transition(if timed_out {
            TaskStatus::Timeout
        } else {
            TaskStatus::Failed
        })?;

        self.breakers.record(&task.category, false).await;
        self.metrics.record_failed(task.worker_kind, &task.category);
        DispatchMetrics::task_failed(task.worker_kind, &task.category, timed_out, started.elapsed());

        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.transition(TaskStatus::RetryQueued)?;
            let delay = self.retry_policy.delay_for_attempt(task.retry_count);
            self.store.retry(&task, delay).await?;

            self.metrics.record_retried(task.worker_kind);
            DispatchMetrics::task_retried(task.worker_kind, task.retry_count);
            debug!(
                task_id = %task.id,
                retry_count = task.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Task scheduled for retry"
            );
            Ok(())
        } else {
            let record = DeadLetterRecord::from_task(task.clone(), error.to_string());
            self.store.dead_letter(&record).await?;

            self.metrics.record_dead_lettered(task.worker_kind);
            DispatchMetrics::task_dead_lettered(task.worker_kind, &task.category);
            warn!(
                task_id = %task.id,
                dlq_id = %record.id,
                retries = task.retry_count,
                error = %error,
                "Task dead-lettered after exhausting retries"
            );
            Ok(())
        }
    }
}
