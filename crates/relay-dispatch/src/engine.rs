//! Engine wiring.
//!
//! Every manager is explicitly constructed and shared by handle; there is no
//! ambient global state. [`DispatchEngine`] is the one-call wiring of the
//! registry, store, lock manager, supervisor, orchestrator and API facade.

use crate::autoscaler::AutoscalerConfig;
use crate::dispatcher::Dispatcher;
use crate::metrics::MetricsHub;
use crate::orchestrator::Orchestrator;
use crate::pool::PoolConfig;
use crate::registry::FunctionRegistry;
use crate::supervisor::{CancellationRegistry, ExecutionSupervisor};
use relay_queue::{LockManager, Partitioner, QueueStore, RetryPolicy};
use relay_resilience::{BreakerRegistry, CategoryRateLimiter, CircuitBreakerConfig, RateLimiterConfig};
use std::sync::Arc;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of partitions, fixed cluster-wide.
    pub partition_count: u32,

    /// Retry backoff policy applied by the supervisor.
    pub retry_policy: RetryPolicy,

    /// Pool behaviour tuning.
    pub pool: PoolConfig,

    /// Autoscaler tuning.
    pub autoscaler: AutoscalerConfig,

    /// Per-category circuit breaker tuning.
    pub breaker: CircuitBreakerConfig,

    /// Per-category admission quotas.
    pub rate_limiter: RateLimiterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partition_count: 16,
            retry_policy: RetryPolicy::default(),
            pool: PoolConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

/// The fully wired dispatcher engine.
pub struct DispatchEngine {
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<Orchestrator>,
    metrics: Arc<MetricsHub>,
}

impl DispatchEngine {
    /// Wires the engine over a function registry, a queue store and a lock
    /// manager.
    pub fn new(
        registry: Arc<FunctionRegistry>,
        store: Arc<dyn QueueStore>,
        locks: Arc<dyn LockManager>,
        config: EngineConfig,
    ) -> Self {
        let metrics = Arc::new(MetricsHub::new());
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let cancellations = Arc::new(CancellationRegistry::new());

        let supervisor = Arc::new(ExecutionSupervisor::new(
            registry.clone(),
            store.clone(),
            breakers.clone(),
            cancellations.clone(),
            config.retry_policy.clone(),
            metrics.clone(),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            supervisor,
            config.partition_count,
            config.pool.clone(),
            config.autoscaler.clone(),
            metrics.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            store,
            locks,
            Partitioner::new(config.partition_count),
            CategoryRateLimiter::new(config.rate_limiter.clone()),
            breakers,
            cancellations,
            metrics.clone(),
        ));

        Self {
            dispatcher,
            orchestrator,
            metrics,
        }
    }

    /// The API facade.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// The pool orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    /// The metrics hub.
    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsHub> {
        self.metrics.clone()
    }

    /// Starts the worker pools and autoscaler.
    pub fn start(&self) {
        self.orchestrator.start();
    }

    /// Stops the worker pools and autoscaler, draining in-flight work.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}
