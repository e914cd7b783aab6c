//! Source probing: accessibility, payload decoding, protocol detection, and
//! reliability scoring.
//!
//! The validator never returns an error to callers; every failure class is
//! folded into a `ValidationResult` with `accessible == false`.

use crate::content;
use crate::protocol::Protocol;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 5;
const HISTORY_CAP: usize = 1_000;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationResult {
    pub url: String,
    pub accessible: bool,
    pub status_code: u16,
    pub content_length: usize,
    pub estimated_configs: usize,
    pub protocols_found: BTreeSet<Protocol>,
    pub reliability_score: f64,
    pub response_time_seconds: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    fn error_result(url: &str, error: impl Into<String>, response_time: Duration) -> Self {
        Self {
            url: url.to_string(),
            accessible: false,
            status_code: 0,
            content_length: 0,
            estimated_configs: 0,
            protocols_found: BTreeSet::new(),
            reliability_score: 0.0,
            response_time_seconds: response_time.as_secs_f64(),
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate view over the validator's bounded history.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ValidationStatistics {
    pub total_validations: usize,
    pub successful_validations: usize,
    pub failed_validations: usize,
    pub average_reliability_score: f64,
    pub average_response_time: f64,
    pub protocol_distribution: HashMap<String, usize>,
    pub error_distribution: HashMap<String, usize>,
}

pub struct SourceValidator {
    client: reqwest::Client,
    history: Mutex<VecDeque<ValidationResult>>,
}

impl SourceValidator {
    pub fn new(user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(DEFAULT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Probe one source. Decodes the payload, detects protocols, estimates
    /// the configuration count, and scores reliability.
    pub async fn validate(&self, url: &str) -> ValidationResult {
        let started = Instant::now();
        let result = match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() != 200 {
                    ValidationResult {
                        status_code: status.as_u16(),
                        ..ValidationResult::error_result(
                            url,
                            format!("HTTP {}", status.as_u16()),
                            started.elapsed(),
                        )
                    }
                } else {
                    match response.text().await {
                        Ok(body) => {
                            let response_time = started.elapsed();
                            let estimated_configs = content::estimate_config_count(&body);
                            let protocols_found = content::detect_protocols(&body);
                            let reliability_score = reliability_score(
                                status.as_u16(),
                                estimated_configs,
                                protocols_found.len(),
                            );
                            ValidationResult {
                                url: url.to_string(),
                                accessible: true,
                                status_code: status.as_u16(),
                                content_length: body.len(),
                                estimated_configs,
                                protocols_found,
                                reliability_score,
                                response_time_seconds: response_time.as_secs_f64(),
                                error: None,
                                timestamp: Utc::now(),
                            }
                        }
                        Err(err) => ValidationResult::error_result(
                            url,
                            format!("body read failed: {err}"),
                            started.elapsed(),
                        ),
                    }
                }
            }
            Err(err) if err.is_timeout() => {
                ValidationResult::error_result(url, "request timeout", started.elapsed())
            }
            Err(err) => ValidationResult::error_result(url, err.to_string(), started.elapsed()),
        };

        tracing::debug!(
            url,
            accessible = result.accessible,
            configs = result.estimated_configs,
            score = result.reliability_score,
            "source validated"
        );
        self.push_history(result.clone());
        result
    }

    /// Validate many sources concurrently under a local cap.
    pub async fn validate_many(
        &self,
        urls: &[String],
        max_concurrent: usize,
    ) -> Vec<ValidationResult> {
        use futures::{stream, StreamExt};
        stream::iter(urls.iter().cloned())
            .map(|url| async move { self.validate(&url).await })
            .buffer_unordered(max_concurrent.max(1))
            .collect()
            .await
    }

    fn push_history(&self, result: ValidationResult) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.push_back(result);
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
    }

    pub fn statistics(&self) -> ValidationStatistics {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        if history.is_empty() {
            return ValidationStatistics::default();
        }

        let mut stats = ValidationStatistics {
            total_validations: history.len(),
            ..Default::default()
        };
        let mut reliability_sum = 0.0;
        let mut response_sum = 0.0;
        for result in history.iter() {
            response_sum += result.response_time_seconds;
            if result.accessible {
                stats.successful_validations += 1;
                reliability_sum += result.reliability_score;
                for protocol in &result.protocols_found {
                    *stats
                        .protocol_distribution
                        .entry(protocol.to_string())
                        .or_default() += 1;
                }
            } else {
                stats.failed_validations += 1;
                let error = result.error.clone().unwrap_or_else(|| "unknown".into());
                *stats.error_distribution.entry(error).or_default() += 1;
            }
        }
        if stats.successful_validations > 0 {
            stats.average_reliability_score =
                reliability_sum / stats.successful_validations as f64;
        }
        stats.average_response_time = response_sum / history.len() as f64;
        stats
    }

    /// History entries at or above a reliability threshold.
    pub fn filter_by_reliability(&self, min_score: f64) -> Vec<ValidationResult> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| r.reliability_score >= min_score)
            .cloned()
            .collect()
    }

    /// Best accessible sources seen so far, by reliability.
    pub fn top_sources(&self, limit: usize) -> Vec<ValidationResult> {
        let mut accessible: Vec<_> = self
            .history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| r.accessible)
            .cloned()
            .collect();
        accessible.sort_by(|a, b| {
            b.reliability_score
                .partial_cmp(&a.reliability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        accessible.truncate(limit);
        accessible
    }
}

impl std::fmt::Debug for SourceValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceValidator").finish()
    }
}

/// Reliability score in [0,1].
///
/// An empty body on a 200 is worth 0.4 (0.5 if at least one protocol scheme
/// appeared anywhere); a huge body saturates at 0.8, or 1.0 with three or
/// more distinct protocols; everything else is additive and clamped.
pub fn reliability_score(status_code: u16, config_count: usize, protocol_count: usize) -> f64 {
    if status_code == 200 && config_count == 0 {
        return if protocol_count > 0 { 0.5 } else { 0.4 };
    }
    if status_code == 200 && config_count >= 100_000 {
        return if protocol_count >= 3 { 1.0 } else { 0.8 };
    }
    let status_score = if status_code == 200 { 0.4 } else { 0.0 };
    let config_score = (config_count as f64 / 10_000.0).min(0.1);
    let diversity_score = (protocol_count as f64 / 5.0).min(1.0) * 0.3;
    (status_score + config_score + diversity_score).clamp(0.0, 1.0)
}
