//! The submission/status API facade.
//!
//! Thin by design: validation and admission control happen here, everything
//! else is delegated to the queue store, the lock manager and the metrics
//! hub. Transport bindings (HTTP, gRPC, in-process) are the host's concern.

use crate::metrics::{DispatchMetrics, MetricsHub, MetricsSnapshot};
use crate::registry::FunctionRegistry;
use crate::supervisor::CancellationRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use relay_core::{
    BatchId, BatchOptions, BatchRecord, DeadLetterId, DeadLetterRecord, DispatchError,
    DispatchResult, TaskDescriptor, TaskId, TaskRecord, TaskStatus, TaskStatusView, WorkerKind,
};
use relay_queue::{LockGrant, LockManager, Partitioner, QueueStore};
use relay_resilience::{BreakerRegistry, CategoryRateLimiter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Successful submission receipt.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub partition: u32,
    /// Estimate only, derived from the tier's SLA target and the queue
    /// depth at the assigned partition.
    pub estimated_completion: DateTime<Utc>,
}

/// Per-item rejection in a batch submission.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BatchRejection {
    pub index: usize,
    pub name: String,
    pub error_code: String,
    pub error: String,
}

/// Batch submission receipt: partial success is reported item-wise.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BatchReceipt {
    pub batch_id: BatchId,
    pub accepted: Vec<SubmitReceipt>,
    pub rejected: Vec<BatchRejection>,
}

/// The externally visible dispatcher surface.
pub struct Dispatcher {
    registry: Arc<FunctionRegistry>,
    store: Arc<dyn QueueStore>,
    locks: Arc<dyn LockManager>,
    partitioner: Partitioner,
    limiter: CategoryRateLimiter,
    breakers: Arc<BreakerRegistry>,
    cancellations: Arc<CancellationRegistry>,
    metrics: Arc<MetricsHub>,
    batches: RwLock<HashMap<BatchId, BatchRecord>>,
}

impl Dispatcher {
    /// Creates a dispatcher over explicitly constructed collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FunctionRegistry>,
        store: Arc<dyn QueueStore>,
        locks: Arc<dyn LockManager>,
        partitioner: Partitioner,
        limiter: CategoryRateLimiter,
        breakers: Arc<BreakerRegistry>,
        cancellations: Arc<CancellationRegistry>,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        Self {
            registry,
            store,
            locks,
            partitioner,
            limiter,
            breakers,
            cancellations,
            metrics,
            batches: RwLock::new(HashMap::new()),
        }
    }

    /// Submits one task.
    ///
    /// Validation, circuit-breaker and rate-limit rejections are synchronous
    /// and nothing is enqueued for them; a store failure also fails closed
    /// rather than buffering in memory.
    pub async fn submit(&self, descriptor: TaskDescriptor) -> DispatchResult<SubmitReceipt> {
        if let Err(error) = self.admit(&descriptor) {
            self.metrics.record_rejected(&descriptor.category);
            DispatchMetrics::task_rejected(&descriptor.category, error.error_code());
            return Err(error);
        }
        if let Err(error) = self.breakers.check(&descriptor.category).await {
            self.metrics.record_rejected(&descriptor.category);
            DispatchMetrics::task_rejected(&descriptor.category, error.error_code());
            return Err(error);
        }

        let partition = self.partitioner.route(&descriptor);
        let task = TaskRecord::from_descriptor(descriptor, partition);
        self.store.enqueue(&task).await?;

        self.metrics.record_submitted(&task.category);
        DispatchMetrics::task_submitted(task.worker_kind, &task.category, task.priority.as_str());
        debug!(
            task_id = %task.id,
            partition,
            priority = %task.priority,
            worker_kind = %task.worker_kind,
            "Task submitted"
        );

        let estimated_completion = self.estimate(&task).await;
        Ok(SubmitReceipt {
            task_id: task.id,
            partition,
            estimated_completion,
        })
    }

    /// Submits a batch. Items that validate are enqueued; items that fail
    /// are reported back without blocking the rest.
    pub async fn submit_batch(
        &self,
        descriptors: Vec<TaskDescriptor>,
        options: BatchOptions,
    ) -> DispatchResult<BatchReceipt> {
        let mut accepted = Vec::new();
        let mut accepted_ids = Vec::new();
        let mut rejected = Vec::new();

        for (index, mut descriptor) in descriptors.into_iter().enumerate() {
            if let Some(priority) = options.priority {
                descriptor.priority = priority;
            }
            let name = descriptor.name.clone();
            match self.submit(descriptor).await {
                Ok(receipt) => {
                    accepted_ids.push(receipt.task_id);
                    accepted.push(receipt);
                }
                Err(error) => rejected.push(BatchRejection {
                    index,
                    name,
                    error_code: error.error_code().to_string(),
                    error: error.to_string(),
                }),
            }
        }

        let record = BatchRecord::new(accepted_ids, options);
        let batch_id = record.id;
        self.batches.write().insert(batch_id, record);

        info!(
            batch_id = %batch_id,
            accepted = accepted.len(),
            rejected = rejected.len(),
            "Batch submitted"
        );
        Ok(BatchReceipt {
            batch_id,
            accepted,
            rejected,
        })
    }

    /// Fetches the status view of a task.
    pub async fn get_status(&self, task_id: &TaskId) -> DispatchResult<TaskStatusView> {
        match self.store.get(task_id).await? {
            Some(task) => Ok(TaskStatusView::from(&task)),
            None => Err(DispatchError::NotFound {
                resource: "task",
                id: task_id.to_string(),
            }),
        }
    }

    /// Cancels a task. Queued tasks become terminal immediately; running
    /// tasks only get their cooperative flag set.
    pub async fn cancel(&self, task_id: &TaskId) -> DispatchResult<TaskStatus> {
        let status = self.store.cancel(task_id).await?;
        if status == TaskStatus::Running {
            self.cancellations.request(task_id);
        }
        Ok(status)
    }

    /// Lists dead-letter records, optionally filtered by worker kind.
    pub async fn list_dead_letters(
        &self,
        worker_kind: Option<WorkerKind>,
    ) -> DispatchResult<Vec<DeadLetterRecord>> {
        self.store.list_dead_letters(worker_kind).await
    }

    /// Replays a dead-letter record: a fresh task id, retry count reset,
    /// record removed. The replayed descriptor passes full submission
    /// validation and may dead-letter again under its new id.
    pub async fn replay(&self, dlq_id: &DeadLetterId) -> DispatchResult<SubmitReceipt> {
        let record = self.store.remove_dead_letter(dlq_id).await?.ok_or_else(|| {
            DispatchError::NotFound {
                resource: "dead_letter",
                id: dlq_id.to_string(),
            }
        })?;

        let task = &record.task;
        let descriptor = TaskDescriptor {
            name: task.name.clone(),
            function: task.function.clone(),
            payload: task.payload.clone(),
            priority: task.priority,
            worker_kind: task.worker_kind,
            category: task.category.clone(),
            timeout_secs: task.timeout_secs,
            max_retries: task.max_retries,
            metadata: task.metadata.clone(),
        };

        match self.submit(descriptor).await {
            Ok(receipt) => {
                DispatchMetrics::task_replayed(task.worker_kind);
                info!(dlq_id = %dlq_id, new_task_id = %receipt.task_id, "Replayed dead-letter record");
                Ok(receipt)
            }
            Err(error) => {
                // Keep the record; a failed replay must not lose it.
                self.store.dead_letter(&record).await?;
                Err(error)
            }
        }
    }

    /// Acquires a lease-based lock on a shared external resource.
    pub async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        lease_secs: u64,
    ) -> DispatchResult<LockGrant> {
        self.locks
            .acquire(key, holder, Duration::from_secs(lease_secs))
            .await
    }

    /// Releases a lock; fails on a stale fencing token.
    pub async fn release_lock(&self, key: &str, holder: &str, token: u64) -> DispatchResult<()> {
        self.locks.release(key, holder, token).await
    }

    /// Renews a lock lease for the current holder.
    pub async fn renew_lock(
        &self,
        key: &str,
        holder: &str,
        token: u64,
        lease_secs: u64,
    ) -> DispatchResult<LockGrant> {
        self.locks
            .renew(key, holder, token, Duration::from_secs(lease_secs))
            .await
    }

    /// Aggregate per-pool / per-category metrics.
    #[must_use]
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Fetches a batch coordination record.
    #[must_use]
    pub fn get_batch(&self, batch_id: &BatchId) -> Option<BatchRecord> {
        self.batches.read().get(batch_id).cloned()
    }

    /// Synchronous admission checks: field validation, registry membership,
    /// category quota.
    fn admit(&self, descriptor: &TaskDescriptor) -> DispatchResult<()> {
        descriptor.validate()?;
        if !self.registry.contains(&descriptor.function) {
            return Err(DispatchError::UnknownFunction(descriptor.function.clone()));
        }
        self.limiter.check(&descriptor.category)
    }

    async fn estimate(&self, task: &TaskRecord) -> DateTime<Utc> {
        let depth = self
            .store
            .depth(task.worker_kind, task.partition)
            .await
            .unwrap_or(0);
        let avg_exec = self.metrics.avg_exec(task.worker_kind);
        let wait = task.priority.sla_target() + avg_exec * depth as u32;
        Utc::now() + ChronoDuration::from_std(wait).unwrap_or_default()
    }
}
