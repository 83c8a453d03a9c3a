//! Per-category admission rate limiting.

use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use parking_lot::RwLock;
use relay_core::{DispatchError, DispatchResult};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Default admission quota per category, in submissions per second.
    pub default_per_second: u32,

    /// Per-category quota overrides.
    pub per_category: HashMap<String, u32>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_per_second: 100,
            per_category: HashMap::new(),
        }
    }
}

/// Category-level admission rate limiter.
///
/// Over-quota submissions are rejected synchronously with a retry-after
/// hint; nothing is ever queued on the caller's behalf.
pub struct CategoryRateLimiter {
    config: RateLimiterConfig,
    limiters: RwLock<HashMap<String, Arc<DirectLimiter>>>,
    clock: DefaultClock,
}

impl CategoryRateLimiter {
    /// Creates a rate limiter from configuration.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            limiters: RwLock::new(HashMap::new()),
            clock: DefaultClock::default(),
        }
    }

    fn limiter(&self, category: &str) -> Arc<DirectLimiter> {
        if let Some(limiter) = self.limiters.read().get(category) {
            return limiter.clone();
        }

        let per_second = self
            .config
            .per_category
            .get(category)
            .copied()
            .unwrap_or(self.config.default_per_second);
        let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN));

        let mut limiters = self.limiters.write();
        limiters
            .entry(category.to_string())
            .or_insert_with(|| Arc::new(GovernorRateLimiter::direct(quota)))
            .clone()
    }

    /// Checks whether a submission in `category` is admitted right now.
    pub fn check(&self, category: &str) -> DispatchResult<()> {
        self.limiter(category).check().map_err(|not_until| {
            let retry_after = not_until.wait_time_from(self.clock.now());
            DispatchError::RateLimited {
                category: category.to_string(),
                retry_after_ms: retry_after.as_millis() as u64,
            }
        })
    }
}

impl std::fmt::Debug for CategoryRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategoryRateLimiter")
            .field("default_per_second", &self.config.default_per_second)
            .finish_non_exhaustive()
    }
}
