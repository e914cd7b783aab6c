//! HTTP fetcher with connection pooling, per-host admission policies,
//! bounded retries, and a process-wide concurrency cap.

use crate::config::FetcherSettings;
use crate::error::{transport_error, FetchError};
use crate::policy::{BreakerConfig, HostPolicies, RateLimitConfig};
use crate::time::{Sleeper, TokioSleeper};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

/// Request shape for callers that need more than a plain GET.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub head: bool,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    rate_limit_hits: AtomicU64,
    retry_attempts: AtomicU64,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FetcherStatistics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub circuit_breaker_trips: u64,
    pub rate_limit_hits: u64,
    pub retry_attempts: u64,
    pub active_connections: usize,
    pub hosts: HashMap<String, HostStatistics>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HostStatistics {
    pub breaker_state: &'static str,
    pub rate_limit_remaining: usize,
}

/// Pooled HTTP client wrapped in per-host policies.
///
/// `fetch` never returns an error: every failure class maps to `None` plus
/// the matching counter, so one bad source cannot abort a run.
pub struct Fetcher {
    client: reqwest::Client,
    policies: HostPolicies,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    settings: FetcherSettings,
    counters: Counters,
    sleeper: Arc<dyn Sleeper>,
}

impl Fetcher {
    pub fn new(settings: FetcherSettings) -> Self {
        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("text/plain, application/json, */*"),
        );
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(settings.timeout)
            .pool_max_idle_per_host(10)
            .default_headers(default_headers)
            .build()
            .unwrap_or_default();
        Self {
            client,
            policies: HostPolicies::new(BreakerConfig::default(), RateLimitConfig::default()),
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent)),
            max_concurrent: settings.max_concurrent,
            settings,
            counters: Counters::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Override the sleeper used between retries (instant tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Fetch `url` as UTF-8 text. `None` on any failure.
    pub async fn fetch(&self, url: &str) -> Option<String> {
        self.fetch_with(url, &FetchOptions::default()).await
    }

    /// Fetch with explicit method/headers/query.
    pub async fn fetch_with(&self, url: &str, options: &FetchOptions) -> Option<String> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("fetcher semaphore closed");
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        let host = host_of(url);
        let policy = self.policies.ensure(&host);

        if policy.limiter.wait().await {
            self.counters.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        }

        let started = Instant::now();
        let result = policy
            .breaker
            .call(|| self.execute_request(url, options))
            .await;

        match result {
            Ok(body) => {
                self.counters
                    .successful_requests
                    .fetch_add(1, Ordering::Relaxed);
                policy.limiter.record_response_time(started.elapsed());
                Some(body)
            }
            Err(err) if err.is_circuit_open() => {
                self.counters
                    .circuit_breaker_trips
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(host = %host, "request rejected, circuit open");
                None
            }
            Err(err) => {
                self.counters.failed_requests.fetch_add(1, Ordering::Relaxed);
                tracing::error!(url, error = %err, "request failed");
                None
            }
        }
    }

    /// One protected attempt sequence: transport failures are retried with
    /// exponential backoff, non-2xx responses are surfaced immediately.
    async fn execute_request(&self, url: &str, options: &FetchOptions) -> Result<String, FetchError> {
        let attempts = self.settings.retry_attempts + 1;
        let mut last: Option<FetchError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                self.counters.retry_attempts.fetch_add(1, Ordering::Relaxed);
                let delay = self.settings.retry_delay * 2_u32.saturating_pow(attempt as u32 - 1);
                self.sleeper.sleep(delay).await;
            }

            tracing::debug!(url, attempt, "fetching");
            let mut request = if options.head {
                self.client.head(url)
            } else {
                self.client.get(url)
            };
            for (name, value) in &options.headers {
                request = request.header(name, value);
            }
            if !options.query.is_empty() {
                request = request.query(&options.query);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        // Not retried here; the breaker still counts it.
                        return Err(FetchError::Http {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    match response.text().await {
                        Ok(body) => return Ok(body),
                        Err(err) => last = Some(transport_error(url, &err)),
                    }
                }
                Err(err) => last = Some(transport_error(url, &err)),
            }
        }

        let last = last.expect("retry loop exits with an error recorded");
        Err(FetchError::RetryExhausted {
            attempts,
            url: url.to_string(),
            last: last.to_string(),
        })
    }

    pub fn statistics(&self) -> FetcherStatistics {
        let hosts = self
            .policies
            .snapshot()
            .into_iter()
            .map(|(host, state, limits)| {
                (
                    host,
                    HostStatistics {
                        breaker_state: state.as_str(),
                        rate_limit_remaining: limits.remaining_requests,
                    },
                )
            })
            .collect();
        FetcherStatistics {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            successful_requests: self.counters.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.counters.failed_requests.load(Ordering::Relaxed),
            circuit_breaker_trips: self.counters.circuit_breaker_trips.load(Ordering::Relaxed),
            rate_limit_hits: self.counters.rate_limit_hits.load(Ordering::Relaxed),
            retry_attempts: self.counters.retry_attempts.load(Ordering::Relaxed),
            active_connections: self.max_concurrent - self.semaphore.available_permits(),
            hosts,
        }
    }

    /// Breaker state for one host, if it has been seen.
    pub fn breaker_state(&self, host: &str) -> Option<&'static str> {
        self.policies
            .get(host)
            .map(|p| p.breaker.current_state().as_str())
    }

    pub fn reset_breaker(&self, host: &str) -> bool {
        self.policies.reset_breaker(host)
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("max_concurrent", &self.max_concurrent)
            .field("policies", &self.policies)
            .finish()
    }
}

/// Host component of a URL, or `"unknown"` when it cannot be parsed.
pub fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://raw.example.com/a/b.txt"), "raw.example.com");
        assert_eq!(host_of("http://127.0.0.1:8080/x"), "127.0.0.1");
        assert_eq!(host_of("not a url"), "unknown");
    }

    #[test]
    fn statistics_start_at_zero() {
        let fetcher = Fetcher::new(FetcherSettings::default());
        let stats = fetcher.statistics();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.active_connections, 0);
        assert!(stats.hosts.is_empty());
    }
}
