//! In-memory queue store.
//!
//! Backs tests and single-node deployments. A single mutex around the whole
//! state makes every operation atomic, which is exactly the claim semantics
//! the trait demands; the Redis store provides the clustered equivalent.

use crate::partition::ordering_score;
use crate::store::QueueStore;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use relay_core::{
    DeadLetterId, DeadLetterRecord, DispatchError, DispatchResult, TaskId, TaskRecord, TaskStatus,
    WorkerKind,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Ordering key for the claimable index: (tier rank, enqueue ms, sequence).
/// The sequence breaks same-millisecond ties while preserving FIFO.
type ReadyKey = (u8, i64, u64);

/// Ordering key for the delayed set: (due ms, sequence).
type DelayedKey = (i64, u64);

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskRecord>,
    ready: HashMap<(WorkerKind, u32), BTreeMap<ReadyKey, TaskId>>,
    delayed: HashMap<(WorkerKind, u32), BTreeMap<DelayedKey, TaskId>>,
    dead: HashMap<WorkerKind, BTreeMap<DelayedKey, DeadLetterRecord>>,
    unavailable: HashSet<u32>,
    seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn check_available(&self, partition: u32) -> DispatchResult<()> {
        if self.unavailable.contains(&partition) {
            return Err(DispatchError::QueueUnavailable(format!(
                "partition {partition} unreachable"
            )));
        }
        Ok(())
    }
}

/// In-memory implementation of [`QueueStore`].
#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
    dlq_cap: usize,
}

impl MemoryQueueStore {
    /// Creates an empty store with the given dead-letter retention cap per
    /// worker kind.
    #[must_use]
    pub fn new(dlq_cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            dlq_cap: dlq_cap.max(1),
        }
    }

    /// Marks a partition reachable or unreachable. Operations against an
    /// unreachable partition fail with `QueueUnavailable`, which exercises
    /// the fail-closed submission path.
    pub fn set_partition_available(&self, partition: u32, available: bool) {
        let mut inner = self.inner.lock();
        if available {
            inner.unavailable.remove(&partition);
        } else {
            inner.unavailable.insert(partition);
        }
    }

    /// Total claimable tasks across all partitions of a worker kind.
    #[must_use]
    pub fn depth_for_kind(&self, worker_kind: WorkerKind) -> u64 {
        let inner = self.inner.lock();
        inner
            .ready
            .iter()
            .filter(|((kind, _), _)| *kind == worker_kind)
            .map(|(_, index)| index.len() as u64)
            .sum()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, task: &TaskRecord) -> DispatchResult<()> {
        let mut inner = self.inner.lock();
        inner.check_available(task.partition)?;

        let seq = inner.next_seq();
        let key: ReadyKey = (
            task.priority.rank(),
            task.created_at.timestamp_millis(),
            seq,
        );
        inner.tasks.insert(task.id, task.clone());
        inner
            .ready
            .entry((task.worker_kind, task.partition))
            .or_default()
            .insert(key, task.id);

        debug!(task_id = %task.id, partition = task.partition, priority = %task.priority, "Enqueued task");
        Ok(())
    }

    async fn claim(
        &self,
        worker_kind: WorkerKind,
        partition: u32,
        worker_id: &str,
    ) -> DispatchResult<Option<TaskRecord>> {
        let mut inner = self.inner.lock();
        inner.check_available(partition)?;

        loop {
            let popped = inner
                .ready
                .get_mut(&(worker_kind, partition))
                .and_then(|index| index.pop_first());

            let Some((_, task_id)) = popped else {
                return Ok(None);
            };

            match inner.tasks.get_mut(&task_id) {
                Some(task) => {
                    task.transition(TaskStatus::Running)?;
                    if task.started_at.is_none() {
                        task.started_at = Some(Utc::now());
                    }
                    debug!(task_id = %task_id, worker_id = %worker_id, "Claimed task");
                    return Ok(Some(task.clone()));
                }
                None => {
                    // Orphaned index entry; skip it.
                    warn!(task_id = %task_id, "Index entry without task record");
                }
            }
        }
    }

    async fn update(&self, task: &TaskRecord) -> DispatchResult<()> {
        let mut inner = self.inner.lock();
        inner.check_available(task.partition)?;
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn retry(&self, task: &TaskRecord, delay: Duration) -> DispatchResult<()> {
        let mut inner = self.inner.lock();
        inner.check_available(task.partition)?;

        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let seq = inner.next_seq();
        inner.tasks.insert(task.id, task.clone());
        inner
            .delayed
            .entry((task.worker_kind, task.partition))
            .or_default()
            .insert((due_ms, seq), task.id);

        debug!(task_id = %task.id, retry_count = task.retry_count, delay_ms = delay.as_millis() as u64, "Scheduled retry");
        Ok(())
    }

    async fn promote_due(&self, worker_kind: WorkerKind, partition: u32) -> DispatchResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_available(partition)?;

        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<(DelayedKey, TaskId)> = inner
            .delayed
            .get(&(worker_kind, partition))
            .map(|set| {
                set.range(..=(now_ms, u64::MAX))
                    .map(|(key, id)| (*key, *id))
                    .collect()
            })
            .unwrap_or_default();

        let mut promoted = 0u64;
        for (key, task_id) in due {
            if let Some(set) = inner.delayed.get_mut(&(worker_kind, partition)) {
                set.remove(&key);
            }
            let Some(priority) = inner.tasks.get(&task_id).map(|t| t.priority) else {
                continue;
            };
            // Promotion time is the FIFO key: a retried task rejoins the
            // back of its tier.
            let seq = inner.next_seq();
            inner
                .ready
                .entry((worker_kind, partition))
                .or_default()
                .insert((priority.rank(), now_ms, seq), task_id);
            promoted += 1;
        }

        if promoted > 0 {
            debug!(worker_kind = %worker_kind, partition, count = promoted, "Promoted delayed tasks");
        }
        Ok(promoted)
    }

    async fn cancel(&self, task_id: &TaskId) -> DispatchResult<TaskStatus> {
        let mut inner = self.inner.lock();

        let Some(task) = inner.tasks.get(task_id).cloned() else {
            return Err(DispatchError::NotFound {
                resource: "task",
                id: task_id.to_string(),
            });
        };

        if task.status.is_terminal() {
            return Err(DispatchError::Conflict(format!(
                "task {task_id} already terminal ({})",
                task.status
            )));
        }

        match task.status {
            TaskStatus::Queued | TaskStatus::RetryQueued => {
                let slot = (task.worker_kind, task.partition);
                if let Some(index) = inner.ready.get_mut(&slot) {
                    index.retain(|_, id| id != task_id);
                }
                if let Some(set) = inner.delayed.get_mut(&slot) {
                    set.retain(|_, id| id != task_id);
                }
                if let Some(task) = inner.tasks.get_mut(task_id) {
                    task.transition(TaskStatus::Cancelled)?;
                    task.completed_at = Some(Utc::now());
                }
                debug!(task_id = %task_id, "Cancelled queued task");
                Ok(TaskStatus::Cancelled)
            }
            TaskStatus::Running => {
                if let Some(task) = inner.tasks.get_mut(task_id) {
                    task.cancel_requested = true;
                }
                debug!(task_id = %task_id, "Requested cooperative cancellation");
                Ok(TaskStatus::Running)
            }
            _ => Err(DispatchError::Conflict(format!(
                "task {task_id} not cancellable in state {}",
                task.status
            ))),
        }
    }

    async fn get(&self, task_id: &TaskId) -> DispatchResult<Option<TaskRecord>> {
        Ok(self.inner.lock().tasks.get(task_id).cloned())
    }

    async fn depth(&self, worker_kind: WorkerKind, partition: u32) -> DispatchResult<u64> {
        let inner = self.inner.lock();
        inner.check_available(partition)?;
        Ok(inner
            .ready
            .get(&(worker_kind, partition))
            .map(|index| index.len() as u64)
            .unwrap_or(0))
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> DispatchResult<()> {
        let mut inner = self.inner.lock();

        if let Some(task) = inner.tasks.get_mut(&record.task.id) {
            *task = record.task.clone();
            task.status = TaskStatus::DeadLettered;
            task.completed_at = Some(record.dead_lettered_at);
        }

        let seq = inner.next_seq();
        let kind = record.task.worker_kind;
        let set = inner.dead.entry(kind).or_default();
        set.insert((record.dead_lettered_at.timestamp_millis(), seq), record.clone());

        while set.len() > self.dlq_cap {
            if let Some((_, evicted)) = set.pop_first() {
                warn!(dlq_id = %evicted.id, worker_kind = %kind, "Evicted oldest dead-letter record");
            }
        }

        debug!(dlq_id = %record.id, task_id = %record.task.id, "Dead-lettered task");
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        worker_kind: Option<WorkerKind>,
    ) -> DispatchResult<Vec<DeadLetterRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<DeadLetterRecord> = match worker_kind {
            Some(kind) => inner
                .dead
                .get(&kind)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default(),
            None => inner
                .dead
                .values()
                .flat_map(|set| set.values().cloned())
                .collect(),
        };
        records.sort_by_key(|r| r.dead_lettered_at);
        Ok(records)
    }

    async fn remove_dead_letter(
        &self,
        id: &DeadLetterId,
    ) -> DispatchResult<Option<DeadLetterRecord>> {
        let mut inner = self.inner.lock();
        for set in inner.dead.values_mut() {
            if let Some(key) = set
                .iter()
                .find(|(_, record)| record.id == *id)
                .map(|(key, _)| *key)
            {
                return Ok(set.remove(&key));
            }
        }
        Ok(None)
    }

    async fn health_check(&self) -> DispatchResult<()> {
        Ok(())
    }
}
