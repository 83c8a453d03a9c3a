//! Task domain model: priority tiers, worker-type affinity, status state
//! machine, payload envelope and the persisted task record.

use crate::error::{DispatchError, DispatchResult};
use crate::id::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Priority tiers, ordered from most urgent to least.
///
/// Each tier carries a target maximum queueing latency used for completion
/// estimates and monitoring only, not as a hard scheduling guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Priority {
    Emergency = 0,
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
    Batch = 5,
    Background = 6,
    Maintenance = 7,
}

impl Priority {
    /// All tiers, most urgent first.
    pub const ALL: [Priority; 8] = [
        Priority::Emergency,
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Batch,
        Priority::Background,
        Priority::Maintenance,
    ];

    /// Ordering rank; lower ranks are claimed first.
    #[must_use]
    pub const fn rank(self) -> u8 {
        self as u8
    }

    /// Target maximum queueing latency for this tier.
    #[must_use]
    pub const fn sla_target(self) -> Duration {
        match self {
            Priority::Emergency => Duration::from_secs(1),
            Priority::Critical => Duration::from_secs(5),
            Priority::High => Duration::from_secs(30),
            Priority::Normal => Duration::from_secs(120),
            Priority::Low => Duration::from_secs(600),
            Priority::Batch => Duration::from_secs(1800),
            Priority::Background => Duration::from_secs(3600),
            Priority::Maintenance => Duration::from_secs(21600),
        }
    }

    /// Returns the tier as a string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::Emergency => "emergency",
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Batch => "batch",
            Priority::Background => "background",
            Priority::Maintenance => "maintenance",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-type affinity; each kind maps to a specialized pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// CPU-bound work; small pool.
    Cpu,
    /// I/O-bound work; large pool.
    Io,
    /// Memory-bound work; small, ceiling-aware pool.
    Memory,
    /// Network-bound work; large, connection-pooled pool.
    Network,
    /// Catch-all; medium pool.
    General,
}

impl WorkerKind {
    /// All worker kinds.
    pub const ALL: [WorkerKind; 5] = [
        WorkerKind::Cpu,
        WorkerKind::Io,
        WorkerKind::Memory,
        WorkerKind::Network,
        WorkerKind::General,
    ];

    /// Returns the kind as a string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Cpu => "cpu",
            WorkerKind::Io => "io",
            WorkerKind::Memory => "memory",
            WorkerKind::Network => "network",
            WorkerKind::General => "general",
        }
    }
}

impl Default for WorkerKind {
    fn default() -> Self {
        WorkerKind::General
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status enumeration.
///
/// Transitions are monotonic:
/// `Queued -> Running -> {Completed, Failed, Timeout}`;
/// `Failed | Timeout -> RetryQueued -> Running` while retries remain;
/// exhausted retries -> `DeadLettered`; `Queued -> Cancelled` before claim;
/// `Running -> Cancelled` cooperatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    RetryQueued,
    Cancelled,
    DeadLettered,
}

impl TaskStatus {
    /// Returns true for states with no outgoing transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::DeadLettered | TaskStatus::Cancelled
        )
    }

    /// Returns true if the state machine permits `self -> to`.
    #[must_use]
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Timeout) | (Running, Cancelled) => {
                true
            }
            (Failed, RetryQueued) | (Failed, DeadLettered) => true,
            (Timeout, RetryQueued) | (Timeout, DeadLettered) => true,
            (RetryQueued, Running) | (RetryQueued, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::RetryQueued => "retry_queued",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::DeadLettered => "dead_lettered",
        };
        f.write_str(s)
    }
}

/// Opaque task payload: a serialized body plus a declared schema identifier.
///
/// The dispatcher never inspects the body; only the registered function
/// deserializes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    /// Schema identifier declared by the submitter.
    pub schema: String,

    /// Serialized payload body.
    pub body: String,
}

impl PayloadEnvelope {
    /// Creates a new payload envelope.
    pub fn new(schema: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            body: body.into(),
        }
    }
}

/// Submission input: everything the caller provides for a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Human-readable label.
    pub name: String,

    /// Function identifier, resolved against the registry at submission.
    pub function: String,

    /// Opaque payload.
    #[serde(default)]
    pub payload: PayloadEnvelope,

    /// Priority tier.
    #[serde(default)]
    pub priority: Priority,

    /// Worker-type affinity.
    #[serde(default)]
    pub worker_kind: WorkerKind,

    /// Category, used for rate limiting and circuit breaking.
    pub category: String,

    /// Execution timeout in seconds.
    pub timeout_secs: u64,

    /// Maximum retry count.
    pub max_retries: u32,

    /// Opaque metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TaskDescriptor {
    /// Validates field-level constraints.
    ///
    /// Registry membership is checked separately at submission.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.name.trim().is_empty() {
            return Err(DispatchError::Validation("task name must not be empty".into()));
        }
        if self.function.trim().is_empty() {
            return Err(DispatchError::Validation(
                "function identifier must not be empty".into(),
            ));
        }
        if self.category.trim().is_empty() {
            return Err(DispatchError::Validation("category must not be empty".into()));
        }
        if self.timeout_secs == 0 {
            return Err(DispatchError::Validation("timeout must be positive".into()));
        }
        if self.max_retries == 0 {
            return Err(DispatchError::Validation(
                "max retries must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Default routing key: category plus worker kind, so related tasks land
    /// on the same shard.
    #[must_use]
    pub fn routing_key(&self) -> String {
        format!("{}:{}", self.category, self.worker_kind)
    }
}

/// The persisted task record, the unit of execution and failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Immutable, globally unique id.
    pub id: TaskId,

    /// Human-readable label.
    pub name: String,

    /// Function identifier.
    pub function: String,

    /// Opaque payload.
    pub payload: PayloadEnvelope,

    /// Priority tier.
    pub priority: Priority,

    /// Worker-type affinity.
    pub worker_kind: WorkerKind,

    /// Category for rate limiting / circuit breaking.
    pub category: String,

    /// Execution timeout in seconds.
    pub timeout_secs: u64,

    /// Maximum retry count.
    pub max_retries: u32,

    /// Current retry count; never exceeds `max_retries`.
    pub retry_count: u32,

    /// Current status.
    pub status: TaskStatus,

    /// Partition assignment, computed once at submission. Retries route to
    /// the same shard.
    pub partition: u32,

    /// Opaque metadata.
    pub metadata: HashMap<String, String>,

    /// Submission timestamp.
    pub created_at: DateTime<Utc>,

    /// First-claim timestamp.
    pub started_at: Option<DateTime<Utc>>,

    /// Terminal timestamp.
    pub completed_at: Option<DateTime<Utc>>,

    /// Result payload on success.
    pub result: Option<PayloadEnvelope>,

    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,

    /// Cooperative cancellation marker; observed by the supervisor when the
    /// running attempt finishes.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl TaskRecord {
    /// Creates a queued record from a descriptor and its computed partition.
    #[must_use]
    pub fn from_descriptor(descriptor: TaskDescriptor, partition: u32) -> Self {
        Self {
            id: TaskId::new(),
            name: descriptor.name,
            function: descriptor.function,
            payload: descriptor.payload,
            priority: descriptor.priority,
            worker_kind: descriptor.worker_kind,
            category: descriptor.category,
            timeout_secs: descriptor.timeout_secs,
            max_retries: descriptor.max_retries,
            retry_count: 0,
            status: TaskStatus::Queued,
            partition,
            metadata: descriptor.metadata,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            last_error: None,
            cancel_requested: false,
        }
    }

    /// Execution timeout as a `Duration`.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns true once the retry budget is spent.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Applies a status transition, enforcing the state machine.
    pub fn transition(&mut self, to: TaskStatus) -> DispatchResult<()> {
        if !self.status.can_transition(to) {
            return Err(DispatchError::Conflict(format!(
                "invalid transition {} -> {} for task {}",
                self.status, to, self.id
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Records the error of a failed attempt.
    pub fn set_error(&mut self, error: &DispatchError) {
        self.last_error = Some(error.to_string());
    }
}

/// Status view returned by the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub worker_kind: WorkerKind,
    pub partition: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<PayloadEnvelope>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&TaskRecord> for TaskStatusView {
    fn from(task: &TaskRecord) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            status: task.status,
            priority: task.priority,
            worker_kind: task.worker_kind,
            partition: task.partition,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            result: task.result.clone(),
            last_error: task.last_error.clone(),
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor {
            name: "ocr-page".into(),
            function: "ocr.process".into(),
            payload: PayloadEnvelope::new("ocr.v1", r#"{"page": 3}"#),
            priority: Priority::High,
            worker_kind: WorkerKind::Cpu,
            category: "ocr".into(),
            timeout_secs: 30,
            max_retries: 3,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn tier_ranks_are_ordered_most_urgent_first() {
        assert!(Priority::Emergency.rank() < Priority::Critical.rank());
        assert!(Priority::Critical.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Maintenance.rank());
    }

    #[test]
    fn sla_targets_grow_with_rank() {
        let mut previous = Duration::ZERO;
        for tier in Priority::ALL {
            assert!(tier.sla_target() > previous);
            previous = tier.sla_target();
        }
    }

    #[test]
    fn valid_descriptor_passes_validation() {
        assert!(descriptor().validate().is_ok());
    }

    #[test]
    fn non_positive_timeout_is_rejected() {
        let mut d = descriptor();
        d.timeout_secs = 0;
        assert!(matches!(d.validate(), Err(DispatchError::Validation(_))));
    }

    #[test]
    fn non_positive_retries_are_rejected() {
        let mut d = descriptor();
        d.max_retries = 0;
        assert!(matches!(d.validate(), Err(DispatchError::Validation(_))));
    }

    #[test]
    fn routing_key_combines_category_and_kind() {
        assert_eq!(descriptor().routing_key(), "ocr:cpu");
    }

    #[test]
    fn state_machine_permits_the_retry_loop() {
        use TaskStatus::*;
        assert!(Queued.can_transition(Running));
        assert!(Running.can_transition(Failed));
        assert!(Failed.can_transition(RetryQueued));
        assert!(RetryQueued.can_transition(Running));
        assert!(Timeout.can_transition(DeadLettered));
    }

    #[test]
    fn state_machine_rejects_backwards_transitions() {
        use TaskStatus::*;
        assert!(!Completed.can_transition(Running));
        assert!(!Cancelled.can_transition(Queued));
        assert!(!DeadLettered.can_transition(RetryQueued));
        assert!(!Queued.can_transition(Completed));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::DeadLettered.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::RetryQueued.is_terminal());
    }

    #[test]
    fn record_transition_enforces_state_machine() {
        let mut task = TaskRecord::from_descriptor(descriptor(), 7);
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.transition(TaskStatus::Running).is_ok());
        assert!(task.transition(TaskStatus::Queued).is_err());
        assert!(task.transition(TaskStatus::Completed).is_ok());
    }

    #[test]
    fn record_serialization_roundtrip() {
        let task = TaskRecord::from_descriptor(descriptor(), 12);
        let json = serde_json::to_string(&task).unwrap();
        let restored: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, task.id);
        assert_eq!(restored.partition, 12);
        assert_eq!(restored.status, TaskStatus::Queued);
    }
}
