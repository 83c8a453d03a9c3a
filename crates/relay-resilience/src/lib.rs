//! # Relay Resilience
//!
//! Admission-control primitives for the dispatcher: a per-category circuit
//! breaker registry (fail fast while a downstream is unhealthy) and a
//! per-category rate limiter (reject over-quota submissions synchronously
//! with a retry-after hint).

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{CategoryRateLimiter, RateLimiterConfig};
