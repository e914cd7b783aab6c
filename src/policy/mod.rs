//! Per-host admission policies: one circuit breaker and one adaptive rate
//! limiter per remote host, created lazily on first use.

pub mod breaker;
pub mod rate_limit;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use rate_limit::{AdaptiveRateLimiter, RateLimitConfig, RateLimitStats, RateLimiter};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Policies guarding a single host.
#[derive(Debug)]
pub struct HostPolicy {
    pub breaker: CircuitBreaker,
    pub limiter: AdaptiveRateLimiter,
}

/// Registry keyed by host name. Entries are never evicted during a run; a
/// crawl touches a bounded set of hosts.
pub struct HostPolicies {
    inner: Mutex<HashMap<String, Arc<HostPolicy>>>,
    breaker_config: BreakerConfig,
    limit_config: RateLimitConfig,
}

impl HostPolicies {
    pub fn new(breaker_config: BreakerConfig, limit_config: RateLimitConfig) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            breaker_config,
            limit_config,
        }
    }

    /// Fetch the policies for `host`, creating them with the configured
    /// defaults on first sight.
    pub fn ensure(&self, host: &str) -> Arc<HostPolicy> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(host.to_string())
            .or_insert_with(|| {
                tracing::debug!(host, "creating host policies");
                Arc::new(HostPolicy {
                    breaker: CircuitBreaker::new(host, self.breaker_config.clone()),
                    limiter: AdaptiveRateLimiter::new(self.limit_config.clone()),
                })
            })
            .clone()
    }

    pub fn get(&self, host: &str) -> Option<Arc<HostPolicy>> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(host)
            .cloned()
    }

    /// Reset the breaker for a host, if one exists.
    pub fn reset_breaker(&self, host: &str) -> bool {
        match self.get(host) {
            Some(policy) => {
                policy.breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted snapshot of (host, breaker state, rate-limit stats).
    pub fn snapshot(&self) -> Vec<(String, CircuitState, RateLimitStats)> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<_> = map
            .iter()
            .map(|(host, policy)| {
                (
                    host.clone(),
                    policy.breaker.current_state(),
                    policy.limiter.stats(),
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl std::fmt::Debug for HostPolicies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPolicies")
            .field("hosts", &self.len())
            .finish()
    }
}
