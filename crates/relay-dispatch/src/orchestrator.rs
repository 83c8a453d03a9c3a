//! Worker pool orchestrator.
//!
//! Owns the five specialized pools and the autoscaler that resizes them.
//! Pool sizing starts from the CPU count available at startup.

use crate::autoscaler::{Autoscaler, AutoscalerConfig};
use crate::metrics::MetricsHub;
use crate::pool::{PoolConfig, SizingPolicy, WorkerPool};
use crate::supervisor::ExecutionSupervisor;
use parking_lot::Mutex;
use relay_core::WorkerKind;
use relay_queue::QueueStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Owns and runs the specialized worker pools.
pub struct Orchestrator {
    pools: HashMap<WorkerKind, Arc<WorkerPool>>,
    autoscaler: Arc<Autoscaler>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds one pool per worker kind, sized from the available CPU count,
    /// plus the autoscaler that adjusts them.
    pub fn new(
        store: Arc<dyn QueueStore>,
        supervisor: Arc<ExecutionSupervisor>,
        partition_count: u32,
        pool_config: PoolConfig,
        autoscaler_config: AutoscalerConfig,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);

        let pools: HashMap<WorkerKind, Arc<WorkerPool>> = WorkerKind::ALL
            .into_iter()
            .map(|kind| {
                let pool = Arc::new(WorkerPool::new(
                    kind,
                    store.clone(),
                    supervisor.clone(),
                    partition_count,
                    SizingPolicy::for_kind(kind, cores),
                    pool_config.clone(),
                ));
                (kind, pool)
            })
            .collect();

        let autoscaler = Arc::new(Autoscaler::new(
            pools.values().cloned().collect(),
            store,
            partition_count,
            autoscaler_config,
            metrics,
        ));

        Self {
            pools,
            autoscaler,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Starts every pool and the autoscaler.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        for pool in self.pools.values() {
            handles.push(tokio::spawn(pool.clone().run()));
        }
        handles.push(tokio::spawn(self.autoscaler.clone().run()));
        info!(pools = self.pools.len(), "Orchestrator started");
    }

    /// Signals every pool and the autoscaler to stop, then waits for them
    /// to drain.
    pub async fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown();
        }
        self.autoscaler.shutdown();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Orchestrator stopped");
    }

    /// The pool for a worker kind.
    #[must_use]
    pub fn pool(&self, kind: WorkerKind) -> Option<&Arc<WorkerPool>> {
        self.pools.get(&kind)
    }

    /// All pools.
    pub fn pools(&self) -> impl Iterator<Item = &Arc<WorkerPool>> {
        self.pools.values()
    }
}
