//! Batch coordination records.
//!
//! A batch is a named group of tasks submitted together. It is a
//! coordination record only; individual tasks remain the unit of execution
//! and failure.

use crate::id::{BatchId, TaskId};
use crate::task::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How members of a batch are expected to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Members run concurrently.
    Parallel,
    /// Members are expected to run one after another.
    Sequential,
    /// The engine may choose based on load.
    Adaptive,
}

impl Default for BatchMode {
    fn default() -> Self {
        BatchMode::Parallel
    }
}

/// Batch-level submission options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Overrides each member's priority when set.
    pub priority: Option<Priority>,

    /// Execution mode.
    #[serde(default)]
    pub mode: BatchMode,

    /// Batch-level timeout in seconds, if any.
    pub timeout_secs: Option<u64>,

    /// Maximum member failures tolerated before the batch is considered
    /// failed by observers.
    pub max_failures: Option<u32>,
}

/// The stored batch coordination record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Batch id.
    pub id: BatchId,

    /// Member task ids, in submission order.
    pub task_ids: Vec<TaskId>,

    /// Options the batch was submitted with.
    pub options: BatchOptions,

    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
}

impl BatchRecord {
    /// Creates a new batch record.
    #[must_use]
    pub fn new(task_ids: Vec<TaskId>, options: BatchOptions) -> Self {
        Self {
            id: BatchId::new(),
            task_ids,
            options,
            created_at: Utc::now(),
        }
    }
}
