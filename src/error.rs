//! Error taxonomy for the aggregation pipeline.

use std::time::Duration;

/// Errors produced on the fetch path. These never escape [`crate::fetch::Fetcher::fetch`]
/// (which maps them to `None` and a counter), but the circuit breaker and the
/// retry loop route on them.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// DNS, TCP, TLS, timeout, or protocol-level failure. Retryable.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// Non-2xx response. Not retried; counts toward the breaker.
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },

    /// Rejected at admission because the host's circuit is open.
    #[error("circuit open for {host} ({failure_count} failures, open for {open_for:?})")]
    CircuitOpen {
        host: String,
        failure_count: usize,
        open_for: Duration,
    },

    /// All transport retries were spent.
    #[error("retries exhausted after {attempts} attempts for {url}, last error: {last}")]
    RetryExhausted {
        attempts: usize,
        url: String,
        last: String,
    },
}

impl FetchError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }
}

/// Catastrophic errors surfaced to callers of the run entry points.
/// Per-source failures never become one of these.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("source configuration unusable: {0}")]
    ConfigLoad(String),

    #[error("output write failed: {0}")]
    Output(#[from] std::io::Error),
}

/// Classify a reqwest failure into the transport taxonomy.
pub(crate) fn transport_error(url: &str, err: &reqwest::Error) -> FetchError {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else if err.is_body() || err.is_decode() {
        "body"
    } else if err.is_request() {
        "request"
    } else {
        "other"
    };
    FetchError::Transport {
        url: url.to_string(),
        message: format!("{kind}: {err}"),
    }
}
