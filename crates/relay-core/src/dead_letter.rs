//! Dead-letter records.

use crate::id::DeadLetterId;
use crate::task::TaskRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable snapshot of a task at the moment its retry budget was spent.
///
/// Created only by the execution supervisor; removed only by explicit
/// replay-and-purge or retention-driven eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Record id, distinct from the task id.
    pub id: DeadLetterId,

    /// The task as it was when retries were exhausted.
    pub task: TaskRecord,

    /// The error of the final attempt.
    pub final_error: String,

    /// Total retries performed.
    pub total_retries: u32,

    /// When the task was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Creates a record from an exhausted task.
    #[must_use]
    pub fn from_task(task: TaskRecord, final_error: String) -> Self {
        let total_retries = task.retry_count;
        Self {
            id: DeadLetterId::new(),
            task,
            final_error,
            total_retries,
            dead_lettered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{PayloadEnvelope, Priority, TaskDescriptor, WorkerKind};
    use std::collections::HashMap;

    #[test]
    fn record_snapshots_retry_count() {
        let descriptor = TaskDescriptor {
            name: "voice-clip".into(),
            function: "voice.synthesize".into(),
            payload: PayloadEnvelope::default(),
            priority: Priority::Normal,
            worker_kind: WorkerKind::Network,
            category: "voice".into(),
            timeout_secs: 10,
            max_retries: 2,
            metadata: HashMap::new(),
        };
        let mut task = TaskRecord::from_descriptor(descriptor, 0);
        task.retry_count = 2;

        let record = DeadLetterRecord::from_task(task.clone(), "provider 503".into());
        assert_eq!(record.total_retries, 2);
        assert_eq!(record.task.id, task.id);
        assert_ne!(record.id.into_inner(), task.id.into_inner());
    }
}
