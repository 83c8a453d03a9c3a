//! # Relay Dispatch
//!
//! The execution half of the relay dispatcher: function registry, five
//! specialized worker pools, the execution supervisor, queue-depth driven
//! autoscaling, and the transport-agnostic submission/status API.
//!
//! ```text
//! submit ──▶ Dispatcher ──▶ Partitioner ──▶ QueueStore
//!                                              │ atomic claim
//!                                              ▼
//!            WorkerPool (cpu/io/memory/network/general)
//!                                              │
//!                                              ▼
//!                                   ExecutionSupervisor
//!                        ┌──────────────┬──────────────┐
//!                        ▼              ▼              ▼
//!                    completed     retry (delayed)  dead letter
//! ```
//!
//! Coordination between workers happens only through the queue store's
//! atomic claim and the lock manager; every manager object is explicitly
//! constructed and passed by handle.

pub mod autoscaler;
pub mod dispatcher;
pub mod engine;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod supervisor;

pub use autoscaler::{Autoscaler, AutoscalerConfig};
pub use dispatcher::{BatchReceipt, BatchRejection, Dispatcher, SubmitReceipt};
pub use engine::{DispatchEngine, EngineConfig};
pub use metrics::{
    register_metrics, CategorySnapshot, DispatchMetrics, MetricsHub, MetricsSnapshot, PoolSnapshot,
};
pub use orchestrator::Orchestrator;
pub use pool::{PoolConfig, SizingPolicy, WorkerPool};
pub use registry::{FunctionContext, FunctionHandler, FunctionRegistry};
pub use supervisor::{CancellationRegistry, ExecutionSupervisor};
