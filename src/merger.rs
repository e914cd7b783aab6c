//! Run orchestration: batches prioritized sources through validation,
//! fetching, and per-line processing, publishing progress along the way.

use crate::error::MergeError;
use crate::events::{types, EventBus};
use crate::fetch::Fetcher;
use crate::jobs::{JobManager, JobStatus};
use crate::output::RunLog;
use crate::processor::{ConfigProcessor, VpnConfiguration};
use crate::protocol::Protocol;
use crate::sources::SourceManager;
use crate::time::epoch_secs;
use crate::validator::SourceValidator;
use futures::{stream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MergerConfig {
    pub batch_size: usize,
    pub max_concurrent: usize,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent: 50,
        }
    }
}

/// Per-source entry in the final report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceReport {
    pub url: String,
    pub accessible: bool,
    pub configs: usize,
    pub reliability_score: f64,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub run_id: String,
    pub configs: Vec<VpnConfiguration>,
    pub sources: Vec<SourceReport>,
    pub started_at: f64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl MergeOutcome {
    pub fn accessible_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.accessible).count()
    }

    pub fn failed_sources(&self) -> Vec<(String, String)> {
        self.sources
            .iter()
            .filter(|s| !s.accessible)
            .map(|s| {
                (
                    s.url.clone(),
                    s.error.clone().unwrap_or_else(|| "unknown".into()),
                )
            })
            .collect()
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id,
            "started_at": self.started_at,
            "elapsed_seconds": self.elapsed.as_secs_f64(),
            "total_configs": self.configs.len(),
            "sources_total": self.sources.len(),
            "sources_accessible": self.accessible_sources(),
            "cancelled": self.cancelled,
        })
    }
}

/// Composes the pipeline for one run. All collaborators are injected; the
/// merger holds no global state of its own.
pub struct Merger {
    sources: Arc<SourceManager>,
    fetcher: Arc<Fetcher>,
    validator: Arc<SourceValidator>,
    processor: Arc<ConfigProcessor>,
    bus: Arc<EventBus>,
    run_log: Option<Arc<RunLog>>,
    config: MergerConfig,
}

impl Merger {
    pub fn new(
        sources: Arc<SourceManager>,
        fetcher: Arc<Fetcher>,
        validator: Arc<SourceValidator>,
        processor: Arc<ConfigProcessor>,
        bus: Arc<EventBus>,
        config: MergerConfig,
    ) -> Self {
        Self {
            sources,
            fetcher,
            validator,
            processor,
            bus,
            run_log: None,
            config,
        }
    }

    /// Record run summaries to a persistent log.
    pub fn with_run_log(mut self, run_log: Arc<RunLog>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    /// Full run over every prioritized source.
    pub async fn run_comprehensive(
        &self,
        max_concurrent: Option<usize>,
    ) -> Result<MergeOutcome, MergeError> {
        let urls = self.sources.prioritized();
        self.run_urls(urls, max_concurrent, None, None).await
    }

    /// Bounded run over the first `max_sources` prioritized sources.
    pub async fn run_quick(&self, max_sources: usize) -> Result<MergeOutcome, MergeError> {
        let mut urls = self.sources.prioritized();
        urls.truncate(max_sources);
        self.run_urls(urls, None, None, None).await
    }

    /// Drive a persisted job to completion, honoring its cancel flag.
    pub async fn run_job(&self, jobs: Arc<JobManager>, job_id: &str) {
        let Some(job) = jobs.get(job_id) else {
            tracing::warn!(job_id, "run requested for unknown job");
            return;
        };
        let cancel = jobs.cancel_flag(job_id);
        jobs.update(job_id, |j| j.status = JobStatus::Running).await;

        match self
            .run_urls(job.sources, None, cancel, Some((jobs.clone(), job_id)))
            .await
        {
            Ok(outcome) => {
                let status = if outcome.cancelled {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Completed
                };
                jobs.update(job_id, |j| {
                    j.status = status;
                    j.total_configs = outcome.configs.len();
                    j.valid_configs = outcome.configs.len();
                    j.finished_at = Some(epoch_secs());
                    if !outcome.cancelled {
                        j.progress = 1.0;
                    }
                })
                .await;
                tracing::info!(job_id, configs = outcome.configs.len(), "job finished");
            }
            Err(err) => {
                jobs.update(job_id, |j| {
                    j.status = JobStatus::Cancelled;
                    j.finished_at = Some(epoch_secs());
                })
                .await;
                tracing::error!(job_id, error = %err, "job failed");
            }
        }
    }

    /// Core loop shared by every entry point.
    pub async fn run_urls(
        &self,
        urls: Vec<String>,
        max_concurrent: Option<usize>,
        cancel: Option<Arc<AtomicBool>>,
        job: Option<(Arc<JobManager>, &str)>,
    ) -> Result<MergeOutcome, MergeError> {
        if urls.is_empty() {
            return Err(MergeError::ConfigLoad("no sources available".into()));
        }

        // A fresh run dedupes from scratch: identical inputs, identical set.
        self.processor.clear();

        let run_id = Uuid::new_v4().to_string();
        let started_at = epoch_secs();
        let started = Instant::now();
        let total = urls.len();
        let concurrency = max_concurrent.unwrap_or(self.config.max_concurrent).max(1);
        let done = AtomicUsize::new(0);

        tracing::info!(run_id = %run_id, total, concurrency, "run started");
        self.bus
            .publish(
                types::RUN_STARTED,
                serde_json::json!({ "run_id": run_id, "total": total }),
                "merger",
            )
            .await;

        let mut configs: Vec<VpnConfiguration> = Vec::new();
        let mut reports: Vec<SourceReport> = Vec::new();
        let mut cancelled = false;

        let batches = total.div_ceil(self.config.batch_size);
        for (batch_index, batch) in urls.chunks(self.config.batch_size).enumerate() {
            if is_cancelled(&cancel) {
                cancelled = true;
                break;
            }

            let batch_results: Vec<(SourceReport, Vec<VpnConfiguration>)> =
                stream::iter(batch.iter().cloned())
                    .map(|url| self.process_source(url, &run_id, &done, total, &cancel))
                    .buffer_unordered(concurrency)
                    .collect()
                    .await;

            for (report, mut batch_configs) in batch_results {
                configs.append(&mut batch_configs);
                reports.push(report);
            }

            self.bus
                .publish(
                    types::BATCH_COMPLETE,
                    serde_json::json!({
                        "run_id": run_id,
                        "batch": batch_index + 1,
                        "batches": batches,
                    }),
                    "merger",
                )
                .await;

            if let Some((jobs, job_id)) = &job {
                let processed = done.load(Ordering::Relaxed);
                jobs.update(job_id, |j| {
                    j.progress = (processed as f64 / total as f64).min(1.0);
                    j.valid_configs = configs.len();
                    j.total_configs = configs.len();
                })
                .await;
            }
        }

        let outcome = MergeOutcome {
            run_id: run_id.clone(),
            configs,
            sources: reports,
            started_at,
            elapsed: started.elapsed(),
            cancelled,
        };

        self.bus
            .publish(
                types::RUN_DONE,
                serde_json::json!({
                    "run_id": run_id,
                    "total": outcome.configs.len(),
                    "sources_total": outcome.sources.len(),
                    "sources_accessible": outcome.accessible_sources(),
                    "elapsed_seconds": outcome.elapsed.as_secs_f64(),
                    "cancelled": outcome.cancelled,
                }),
                "merger",
            )
            .await;
        if let Some(run_log) = &self.run_log {
            run_log.append(&outcome.summary()).await;
        }
        tracing::info!(
            run_id = %run_id,
            configs = outcome.configs.len(),
            cancelled = outcome.cancelled,
            "run done"
        );
        Ok(outcome)
    }

    async fn process_source(
        &self,
        url: String,
        run_id: &str,
        done: &AtomicUsize,
        total: usize,
        cancel: &Option<Arc<AtomicBool>>,
    ) -> (SourceReport, Vec<VpnConfiguration>) {
        if is_cancelled(cancel) {
            return (
                SourceReport {
                    url,
                    accessible: false,
                    configs: 0,
                    reliability_score: 0.0,
                    error: Some("cancelled".into()),
                },
                Vec::new(),
            );
        }

        let validation = self.validator.validate(&url).await;
        self.bus
            .publish(
                types::SOURCE_VALIDATED,
                serde_json::json!({
                    "run_id": run_id,
                    "url": url,
                    "accessible": validation.accessible,
                    "reliability_score": validation.reliability_score,
                }),
                "merger",
            )
            .await;

        let mut report = SourceReport {
            url: url.clone(),
            accessible: validation.accessible,
            configs: 0,
            reliability_score: validation.reliability_score,
            error: validation.error.clone(),
        };
        let mut accepted = Vec::new();

        if validation.accessible {
            self.sources.record_success(&url);
            match self.fetcher.fetch(&url).await {
                Some(body) => {
                    for line in body.lines() {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if let Some(config) = self.processor.process(line, Some(&url)) {
                            accepted.push(config);
                        }
                    }
                    report.configs = accepted.len();
                }
                None => {
                    report.error = Some("fetch failed".into());
                }
            }
        } else if self.sources.record_failure(&url) {
            self.bus
                .publish(
                    types::SOURCE_QUARANTINED,
                    serde_json::json!({ "run_id": run_id, "url": url }),
                    "merger",
                )
                .await;
        }

        let processed = done.fetch_add(1, Ordering::Relaxed) + 1;
        self.bus
            .publish(
                types::FETCH_PROGRESS,
                serde_json::json!({ "run_id": run_id, "done": processed, "total": total }),
                "merger",
            )
            .await;

        (report, accepted)
    }

    /// Validate explicit URLs and keep those at or above `min_score`.
    pub async fn validate_sources(
        &self,
        urls: &[String],
        min_score: f64,
    ) -> Vec<(String, f64)> {
        self.validator
            .validate_many(urls, self.config.max_concurrent.min(10))
            .await
            .into_iter()
            .filter(|r| r.reliability_score >= min_score)
            .map(|r| (r.url, r.reliability_score))
            .collect()
    }

    /// Sort raw lines by deterministic quality, best first.
    pub fn score_and_sort(&self, lines: &[String]) -> Vec<String> {
        let mut scored: Vec<(f64, &String)> = lines
            .iter()
            .map(|line| {
                let protocol = Protocol::from_uri(line);
                (crate::processor::quality_score(line.trim(), protocol), line)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, line)| line.clone()).collect()
    }
}

impl std::fmt::Debug for Merger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merger").field("config", &self.config).finish()
    }
}

fn is_cancelled(cancel: &Option<Arc<AtomicBool>>) -> bool {
    cancel
        .as_ref()
        .is_some_and(|flag| flag.load(Ordering::Acquire))
}
