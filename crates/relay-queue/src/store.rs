//! Queue store abstraction.

use async_trait::async_trait;
use relay_core::{
    DeadLetterId, DeadLetterRecord, DispatchResult, TaskId, TaskRecord, TaskStatus, WorkerKind,
};
use std::time::Duration;

/// The partitioned queue store behind the dispatcher.
///
/// Implementations must make `claim` atomic with respect to concurrent
/// callers: no two workers may successfully claim the same task id. All
/// other coordination between workers goes through the lock manager; the
/// store itself never requires a read-modify-write across two round trips.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Durably writes a queued task: the full record plus its entry in the
    /// `(worker_kind, partition)` ordered index.
    async fn enqueue(&self, task: &TaskRecord) -> DispatchResult<()>;

    /// Atomically claims the highest-priority task of a partition, marking
    /// it running. Returns `None` when nothing is claimable.
    async fn claim(
        &self,
        worker_kind: WorkerKind,
        partition: u32,
        worker_id: &str,
    ) -> DispatchResult<Option<TaskRecord>>;

    /// Persists a record mutation (status, result, error fields). Owned by
    /// the execution supervisor after a successful claim.
    async fn update(&self, task: &TaskRecord) -> DispatchResult<()>;

    /// Schedules a failed task for a later attempt: persists the record
    /// (already marked `RetryQueued`) and parks it in the partition's
    /// delayed set until `delay` elapses.
    async fn retry(&self, task: &TaskRecord, delay: Duration) -> DispatchResult<()>;

    /// Moves due delayed tasks back into the claimable index. Returns the
    /// number promoted. Called by workers ahead of each claim attempt.
    async fn promote_due(&self, worker_kind: WorkerKind, partition: u32) -> DispatchResult<u64>;

    /// Cancels a task.
    ///
    /// A still-queued task is removed from the index and becomes
    /// `Cancelled`; it will never be claimed. A running task only gets its
    /// cooperative cancel marker set and stays `Running` until the
    /// supervisor observes the marker. Terminal tasks yield `Conflict`.
    /// Returns the status after the call.
    async fn cancel(&self, task_id: &TaskId) -> DispatchResult<TaskStatus>;

    /// Fetches a task record.
    async fn get(&self, task_id: &TaskId) -> DispatchResult<Option<TaskRecord>>;

    /// Number of claimable tasks in a partition index.
    async fn depth(&self, worker_kind: WorkerKind, partition: u32) -> DispatchResult<u64>;

    /// Writes a dead-letter record exactly once, marks the task
    /// `DeadLettered`, and enforces per-worker-kind retention (oldest
    /// evicted beyond the cap).
    async fn dead_letter(&self, record: &DeadLetterRecord) -> DispatchResult<()>;

    /// Lists dead-letter records, optionally filtered by worker kind,
    /// oldest first.
    async fn list_dead_letters(
        &self,
        worker_kind: Option<WorkerKind>,
    ) -> DispatchResult<Vec<DeadLetterRecord>>;

    /// Removes and returns a dead-letter record (replay-and-purge).
    async fn remove_dead_letter(
        &self,
        id: &DeadLetterId,
    ) -> DispatchResult<Option<DeadLetterRecord>>;

    /// Store reachability check.
    async fn health_check(&self) -> DispatchResult<()>;
}
