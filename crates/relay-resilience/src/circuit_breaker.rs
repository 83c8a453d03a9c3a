//! Per-category circuit breaker.

use parking_lot::RwLock as SyncRwLock;
use relay_core::{DispatchError, DispatchResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed - submissions are allowed.
    Closed = 0,
    /// Circuit is open - submissions are rejected.
    Open = 1,
    /// Circuit is half-open - a limited probe budget is allowed.
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u64,
    /// Successes needed to close the circuit from half-open.
    pub success_threshold: u64,
    /// How long the circuit stays open before allowing half-open probes.
    pub open_timeout: Duration,
    /// Probe budget in the half-open state.
    pub half_open_probes: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(30),
            half_open_probes: 3,
        }
    }
}

/// Circuit breaker for one downstream category.
///
/// Outcomes are reported by the execution supervisor; admission checks run
/// at submission time, so an open circuit rejects new work before it is ever
/// enqueued.
pub struct CircuitBreaker {
    category: String,
    state: AtomicU8,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    half_open_requests: AtomicU64,
    last_failure_time: RwLock<Option<Instant>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker.
    pub fn new(category: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            category: category.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            half_open_requests: AtomicU64::new(0),
            last_failure_time: RwLock::new(None),
            config,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Returns the category this breaker guards.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Admission check. Fails fast with `CircuitOpen` while the circuit is
    /// open; consumes one probe while half-open.
    pub async fn try_acquire(&self) -> DispatchResult<()> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let last_failure = self.last_failure_time.read().await;
                if let Some(time) = *last_failure {
                    if time.elapsed() >= self.config.open_timeout {
                        self.state
                            .store(CircuitState::HalfOpen as u8, Ordering::SeqCst);
                        self.success_count.store(0, Ordering::SeqCst);
                        self.half_open_requests.store(0, Ordering::SeqCst);
                        debug!(category = %self.category, "Circuit transitioning to half-open");
                        return Ok(());
                    }
                }
                Err(DispatchError::CircuitOpen(self.category.clone()))
            }
            CircuitState::HalfOpen => {
                let requests = self.half_open_requests.fetch_add(1, Ordering::SeqCst);
                if requests < self.config.half_open_probes {
                    Ok(())
                } else {
                    Err(DispatchError::CircuitOpen(self.category.clone()))
                }
            }
        }
    }

    /// Records a successful execution.
    pub async fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.state
                        .store(CircuitState::Closed as u8, Ordering::SeqCst);
                    self.failure_count.store(0, Ordering::SeqCst);
                    debug!(category = %self.category, "Circuit closed after successful recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed execution.
    pub async fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                *self.last_failure_time.write().await = Some(Instant::now());

                if failures >= self.config.failure_threshold {
                    self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
                    warn!(
                        category = %self.category,
                        failures,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open reopens the circuit.
                self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
                *self.last_failure_time.write().await = Some(Instant::now());
                warn!(category = %self.category, "Circuit reopened after half-open failure");
            }
            CircuitState::Open => {
                *self.last_failure_time.write().await = Some(Instant::now());
            }
        }
    }

    /// Manually resets the breaker to closed.
    pub async fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        *self.last_failure_time.write().await = None;
        debug!(category = %self.category, "Circuit manually reset");
    }
}

/// Lazily-populated registry of breakers, one per category.
pub struct BreakerRegistry {
    breakers: SyncRwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    /// Creates a registry; every breaker shares the same configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: SyncRwLock::new(HashMap::new()),
            config,
        }
    }

    /// Returns the breaker for a category, creating it on first use.
    pub fn breaker(&self, category: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(category) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(category.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(category, self.config.clone()))
            })
            .clone()
    }

    /// Admission check for a category.
    pub async fn check(&self, category: &str) -> DispatchResult<()> {
        self.breaker(category).try_acquire().await
    }

    /// Reports an execution outcome for a category.
    pub async fn record(&self, category: &str, success: bool) {
        let breaker = self.breaker(category);
        if success {
            breaker.record_success().await;
        } else {
            breaker.record_failure().await;
        }
    }

    /// Current state of every known breaker, for metrics.
    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .iter()
            .map(|(category, breaker)| (category.clone(), breaker.state()))
            .collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
