//! Function registry.
//!
//! Maps a stable string identifier to an invocable unit of work, supplied by
//! the hosting application. The dispatcher never inspects a function's
//! internals; it validates identifiers at submission time and hands the
//! opaque payload to the handler at execution time.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use relay_core::{DispatchResult, PayloadEnvelope, TaskId, TaskRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// A registered function handler.
pub type FunctionHandler =
    Arc<dyn Fn(FunctionContext) -> BoxFuture<'static, DispatchResult<PayloadEnvelope>> + Send + Sync>;

/// Execution context handed to a registered function.
///
/// Cancellation is cooperative: the function is expected to poll
/// [`FunctionContext::is_cancelled`] at its own checkpoints. The dispatcher
/// never interrupts a running function forcefully.
#[derive(Clone)]
pub struct FunctionContext {
    /// Task id.
    pub task_id: TaskId,

    /// Task name.
    pub name: String,

    /// Opaque payload; the handler deserializes the body against the
    /// declared schema.
    pub payload: PayloadEnvelope,

    /// Task metadata.
    pub metadata: HashMap<String, String>,

    /// Retry count at the time of this attempt (0 for the first attempt).
    pub attempt: u32,

    /// Maximum retries configured for the task.
    pub max_retries: u32,

    /// Worker executing this attempt.
    pub worker_id: String,

    cancelled: Arc<AtomicBool>,
}

impl FunctionContext {
    pub(crate) fn new(task: &TaskRecord, worker_id: &str, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            payload: task.payload.clone(),
            metadata: task.metadata.clone(),
            attempt: task.retry_count,
            max_retries: task.max_retries,
            worker_id: worker_id.to_string(),
            cancelled,
        }
    }

    /// Cooperative cancellation checkpoint.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns true if this is the last attempt before dead-lettering.
    #[must_use]
    pub const fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_retries
    }
}

impl std::fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionContext")
            .field("task_id", &self.task_id)
            .field("name", &self.name)
            .field("attempt", &self.attempt)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// Registry of invocable functions, keyed by stable identifier.
#[derive(Default)]
pub struct FunctionRegistry {
    handlers: RwLock<HashMap<String, FunctionHandler>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function handler under an identifier. Replaces any
    /// previous registration for the same identifier.
    pub fn register<F>(&self, identifier: impl Into<String>, handler: F)
    where
        F: Fn(FunctionContext) -> BoxFuture<'static, DispatchResult<PayloadEnvelope>>
            + Send
            + Sync
            + 'static,
    {
        let identifier = identifier.into();
        self.handlers
            .write()
            .insert(identifier.clone(), Arc::new(handler));
        info!(function = %identifier, "Registered function");
    }

    /// Returns true if an identifier is registered.
    #[must_use]
    pub fn contains(&self, identifier: &str) -> bool {
        self.handlers.read().contains_key(identifier)
    }

    /// Fetches a handler by identifier.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<FunctionHandler> {
        self.handlers.read().get(identifier).cloned()
    }

    /// Registered identifiers.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let registry = FunctionRegistry::new();
        assert!(!registry.contains("echo"));

        registry.register("echo", |ctx: FunctionContext| {
            Box::pin(async move { Ok(ctx.payload) })
        });

        assert!(registry.contains("echo"));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn handler_receives_the_payload() {
        let registry = FunctionRegistry::new();
        registry.register("echo", |ctx: FunctionContext| {
            Box::pin(async move { Ok(ctx.payload) })
        });

        let descriptor = relay_core::TaskDescriptor {
            name: "t".into(),
            function: "echo".into(),
            payload: PayloadEnvelope::new("v1", "body"),
            priority: relay_core::Priority::Normal,
            worker_kind: relay_core::WorkerKind::General,
            category: "c".into(),
            timeout_secs: 5,
            max_retries: 1,
            metadata: HashMap::new(),
        };
        let task = TaskRecord::from_descriptor(descriptor, 0);
        let ctx = FunctionContext::new(&task, "w1", Arc::new(AtomicBool::new(false)));

        let handler = registry.get("echo").unwrap();
        let result = handler(ctx).await.unwrap();
        assert_eq!(result.body, "body");
    }

    #[test]
    fn cancellation_flag_is_shared() {
        let flag = Arc::new(AtomicBool::new(false));
        let descriptor = relay_core::TaskDescriptor {
            name: "t".into(),
            function: "f".into(),
            payload: PayloadEnvelope::default(),
            priority: relay_core::Priority::Normal,
            worker_kind: relay_core::WorkerKind::General,
            category: "c".into(),
            timeout_secs: 5,
            max_retries: 1,
            metadata: HashMap::new(),
        };
        let task = TaskRecord::from_descriptor(descriptor, 0);
        let ctx = FunctionContext::new(&task, "w1", flag.clone());

        assert!(!ctx.is_cancelled());
        flag.store(true, Ordering::SeqCst);
        assert!(ctx.is_cancelled());
    }
}
