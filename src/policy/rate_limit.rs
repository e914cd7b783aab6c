//! Per-host request admission with a sliding window and a burst window.

use crate::time::{Clock, MonotonicClock, Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Granularity at which [`RateLimiter::wait`] polls for admission.
const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests admitted per sliding window.
    pub max_requests: usize,
    /// Sliding window width.
    pub window: Duration,
    /// Requests admitted per burst window.
    pub burst_limit: usize,
    /// Burst window width.
    pub burst_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            burst_limit: 10,
            burst_window: Duration::from_secs(1),
        }
    }
}

/// Snapshot of a limiter's admission state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RateLimitStats {
    pub current_requests: usize,
    pub current_burst: usize,
    pub max_requests: usize,
    pub max_burst: usize,
    pub remaining_requests: usize,
    pub remaining_burst: usize,
}

struct WindowState {
    requests: VecDeque<u64>,
    burst: VecDeque<u64>,
    /// Effective cap; the adaptive variant moves this between its floor and 100.
    max_requests: usize,
}

/// Sliding-window limiter for one host.
///
/// A request is admitted iff, after evicting entries older than the window
/// from both deques, each deque is under its cap. Admission appends `now`
/// to both.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<WindowState>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let max_requests = config.max_requests;
        Self {
            config,
            state: Mutex::new(WindowState {
                requests: VecDeque::new(),
                burst: VecDeque::new(),
                max_requests,
            }),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the sleeper (instant tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Try to admit one request now.
    pub fn allow(&self) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Self::evict(&mut state, now, &self.config);

        if state.burst.len() >= self.config.burst_limit {
            tracing::debug!(burst = state.burst.len(), "rate limit burst exceeded");
            return false;
        }
        if state.requests.len() >= state.max_requests {
            tracing::debug!(window = state.requests.len(), "rate limit exceeded");
            return false;
        }

        state.requests.push_back(now);
        state.burst.push_back(now);
        true
    }

    /// Block (cooperatively) until one request is admitted. Returns whether
    /// any waiting was required, so callers can count rate-limit hits.
    pub async fn wait(&self) -> bool {
        let mut waited = false;
        while !self.allow() {
            waited = true;
            self.sleeper.sleep(WAIT_POLL).await;
        }
        waited
    }

    pub fn stats(&self) -> RateLimitStats {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Self::evict(&mut state, now, &self.config);
        RateLimitStats {
            current_requests: state.requests.len(),
            current_burst: state.burst.len(),
            max_requests: state.max_requests,
            max_burst: self.config.burst_limit,
            remaining_requests: state.max_requests.saturating_sub(state.requests.len()),
            remaining_burst: self.config.burst_limit.saturating_sub(state.burst.len()),
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.requests.clear();
        state.burst.clear();
    }

    fn evict(state: &mut WindowState, now: u64, config: &RateLimitConfig) {
        let cutoff = now.saturating_sub(config.window.as_millis() as u64);
        while state.requests.front().is_some_and(|&t| t < cutoff) {
            state.requests.pop_front();
        }
        let burst_cutoff = now.saturating_sub(config.burst_window.as_millis() as u64);
        while state.burst.front().is_some_and(|&t| t < burst_cutoff) {
            state.burst.pop_front();
        }
    }

    fn effective_cap(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .max_requests
    }

    fn set_effective_cap(&self, cap: usize) {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .max_requests = cap;
    }
}

/// Limiter that also tracks response times and moves its effective cap:
/// slow responses shrink it toward a floor, fast responses grow it back.
pub struct AdaptiveRateLimiter {
    inner: RateLimiter,
    window: Duration,
    min_requests: usize,
    slow_threshold: Duration,
    samples: Mutex<VecDeque<(u64, f64)>>,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("min_requests", &self.min_requests)
            .field("slow_threshold", &self.slow_threshold)
            .finish()
    }
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let window = config.window;
        Self {
            inner: RateLimiter::new(config),
            window,
            min_requests: 10,
            slow_threshold: Duration::from_secs(1),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.inner = self.inner.with_clock(clock);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.inner = self.inner.with_sleeper(sleeper);
        self
    }

    pub fn with_min_requests(mut self, min: usize) -> Self {
        self.min_requests = min;
        self
    }

    pub fn allow(&self) -> bool {
        self.inner.allow()
    }

    pub async fn wait(&self) -> bool {
        self.inner.wait().await
    }

    pub fn stats(&self) -> RateLimitStats {
        self.inner.stats()
    }

    pub fn reset(&self) {
        self.inner.reset();
        self.samples
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Record one observed response time and re-derive the effective cap.
    pub fn record_response_time(&self, response_time: Duration) {
        let now = self.inner.clock.now_millis();
        let mean = {
            let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
            samples.push_back((now, response_time.as_secs_f64()));
            let cutoff = now.saturating_sub(self.window.as_millis() as u64);
            while samples.front().is_some_and(|&(t, _)| t < cutoff) {
                samples.pop_front();
            }
            let sum: f64 = samples.iter().map(|&(_, rt)| rt).sum();
            sum / samples.len() as f64
        };

        let cap = self.inner.effective_cap();
        let adjusted = if mean > self.slow_threshold.as_secs_f64() {
            self.min_requests.max((cap as f64 * 0.8) as usize)
        } else {
            100.min((cap as f64 * 1.1) as usize)
        };
        if adjusted != cap {
            tracing::debug!(from = cap, to = adjusted, mean_secs = mean, "adaptive cap moved");
            self.inner.set_effective_cap(adjusted);
        }
    }
}
