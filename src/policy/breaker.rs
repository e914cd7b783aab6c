//! Per-host circuit breaker with lock-free state transitions.
//!
//! Transitions are serialized per host via compare-and-swap; the protected
//! call is never made while holding any lock.

use crate::error::FetchError;
use crate::time::{Clock, MonotonicClock};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: usize,
    /// How long the circuit stays open before one probe is admitted.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_probe: AtomicUsize,
}

/// Circuit breaker guarding one host.
#[derive(Clone)]
pub struct CircuitBreaker {
    host: String,
    state: Arc<BreakerState>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("host", &self.host)
            .field("state", &self.current_state())
            .field("failures", &self.failure_count())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(host: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            host: host.into(),
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_probe: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Run `operation` through the breaker. When the circuit is open and the
    /// recovery timeout has not elapsed, returns [`FetchError::CircuitOpen`]
    /// without invoking the operation.
    pub async fn call<T, Fut, Op>(&self, mut operation: Op) -> Result<T, FetchError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FetchError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.recovery_timeout.as_millis() as u64 {
                        return Err(self.open_error(elapsed));
                    }
                    // Recovery window elapsed: race to become the half-open probe.
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!(host = %self.host, "circuit breaker half-open");
                            self.state.half_open_probe.store(1, Ordering::Release);
                            break;
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    // Exactly one probing call is admitted.
                    let probes = self.state.half_open_probe.fetch_add(1, Ordering::AcqRel);
                    if probes >= 1 {
                        self.state.half_open_probe.fetch_sub(1, Ordering::Release);
                        return Err(self.open_error(0));
                    }
                    break;
                }
                _ => break,
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;
        if was_half_open {
            self.state.half_open_probe.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    pub fn current_state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    /// Force the breaker back to closed, clearing failures.
    pub fn reset(&self) {
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        self.state.failure_count.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.half_open_probe.store(0, Ordering::Release);
        tracing::info!(host = %self.host, "circuit breaker reset to closed");
    }

    fn open_error(&self, elapsed_millis: u64) -> FetchError {
        FetchError::CircuitOpen {
            host: self.host.clone(),
            failure_count: self.failure_count(),
            open_for: Duration::from_millis(elapsed_millis),
        }
    }

    fn on_success(&self) {
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!(host = %self.host, "circuit breaker closed");
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state
                        .opened_at_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(host = %self.host, failures, "probe failed, circuit open again");
                }
            }
            STATE_CLOSED if failures >= self.config.failure_threshold => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state
                        .opened_at_millis
                        .store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(
                        host = %self.host,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker open"
                    );
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transport() -> FetchError {
        FetchError::Transport {
            url: "https://example.com/sub".into(),
            message: "timeout".into(),
        }
    }

    fn breaker(threshold: usize, recovery: Duration, clock: ManualClock) -> CircuitBreaker {
        CircuitBreaker::new(
            "example.com",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
            },
        )
        .with_clock(clock)
    }

    #[tokio::test]
    async fn starts_closed_and_executes() {
        let cb = breaker(3, Duration::from_secs(60), ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = cb
            .call(|| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FetchError>(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let cb = breaker(5, Duration::from_secs(60), ManualClock::new());
        for _ in 0..5 {
            let _ = cb.call(|| async { Err::<(), _>(transport()) }).await;
        }
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 5);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = cb
            .call(|| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FetchError>(())
                }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "open circuit must not invoke");
    }

    #[tokio::test]
    async fn admits_single_probe_after_recovery() {
        let clock = ManualClock::new();
        let cb = breaker(2, Duration::from_secs(60), clock.clone());
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(transport()) }).await;
        }
        assert_eq!(cb.current_state(), CircuitState::Open);

        clock.advance(60_001);
        let result = cb.call(|| async { Ok::<_, FetchError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let clock = ManualClock::new();
        let cb = breaker(1, Duration::from_secs(30), clock.clone());
        let _ = cb.call(|| async { Err::<(), _>(transport()) }).await;
        assert_eq!(cb.current_state(), CircuitState::Open);

        clock.advance(30_001);
        let _ = cb.call(|| async { Err::<(), _>(transport()) }).await;
        assert_eq!(cb.current_state(), CircuitState::Open);

        // Rejected again until a fresh recovery window passes.
        let result = cb.call(|| async { Ok::<_, FetchError>(()) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn success_resets_failure_streak_when_closed() {
        let cb = breaker(3, Duration::from_secs(60), ManualClock::new());
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(transport()) }).await;
        }
        let _ = cb.call(|| async { Ok::<_, FetchError>(()) }).await;
        assert_eq!(cb.failure_count(), 0);

        // Two more failures do not open the circuit after the reset.
        for _ in 0..2 {
            let result = cb.call(|| async { Err::<(), _>(transport()) }).await;
            assert!(result.unwrap_err().is_transport());
        }
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let cb = breaker(1, Duration::from_secs(60), ManualClock::new());
        let _ = cb.call(|| async { Err::<(), _>(transport()) }).await;
        assert_eq!(cb.current_state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        let result = cb.call(|| async { Ok::<_, FetchError>(1) }).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_probes_admit_exactly_one() {
        let clock = ManualClock::new();
        let cb = breaker(1, Duration::from_millis(100), clock.clone());
        let _ = cb.call(|| async { Err::<(), _>(transport()) }).await;
        clock.advance(150);

        let executed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let cb = cb.clone();
            let executed = executed.clone();
            handles.push(tokio::spawn(async move {
                cb.call(|| {
                    let executed = executed.clone();
                    async move {
                        executed.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, FetchError>(())
                    }
                })
                .await
            }));
        }
        let results: Vec<_> = futures::future::join_all(handles).await;
        let ok = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| {
                r.as_ref()
                    .unwrap()
                    .as_ref()
                    .err()
                    .is_some_and(|e| e.is_circuit_open())
            })
            .count();
        assert_eq!(ok, 1, "exactly one probe succeeds");
        assert_eq!(rejected, 2, "other callers rejected while probing");
    }
}
