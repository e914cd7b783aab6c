//! Persistent job handles for long-running merges.
//!
//! State lives in memory; every meaningful change is mirrored to a backend
//! (single JSON file, or a key-value store when `REDIS_URL` is set). Saves
//! are best-effort: a failed save is counted and logged, never fatal.

use crate::config::Settings;
use crate::time::epoch_secs;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub sources: Vec<String>,
    pub status: JobStatus,
    pub total_configs: usize,
    pub valid_configs: usize,
    /// Monotonically non-decreasing while running.
    pub progress: f64,
    pub started_at: f64,
    pub finished_at: Option<f64>,
}

impl Job {
    fn new(id: String, sources: Vec<String>) -> Self {
        Self {
            id,
            sources,
            status: JobStatus::Pending,
            total_configs: 0,
            valid_configs: 0,
            progress: 0.0,
            started_at: epoch_secs(),
            finished_at: None,
        }
    }
}

/// Persistence backend. Implementations swallow their own transport errors
/// into the returned result; the manager decides that they are non-fatal.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self) -> Vec<Job>;
    /// Persist a change. `snapshot` is the full collection for backends that
    /// write one document; `changed` is the touched job for keyed backends.
    async fn save(&self, changed: &Job, snapshot: &[Job]) -> Result<(), String>;
    async fn remove(&self, id: &str, snapshot: &[Job]) -> Result<(), String>;
}

/// Whole-collection JSON file backend.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn write_document(&self, jobs: &[Job]) -> Result<(), String> {
        let document = JobsDocument {
            jobs: jobs.to_vec(),
        };
        let text = serde_json::to_string_pretty(&document).map_err(|e| e.to_string())?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| e.to_string())?;
        }
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| e.to_string())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct JobsDocument {
    jobs: Vec<Job>,
}

#[async_trait]
impl JobStore for JsonFileStore {
    async fn load(&self) -> Vec<Job> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => serde_json::from_str::<JobsDocument>(&text)
                .map(|doc| doc.jobs)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn save(&self, _changed: &Job, snapshot: &[Job]) -> Result<(), String> {
        self.write_document(snapshot).await
    }

    async fn remove(&self, _id: &str, snapshot: &[Job]) -> Result<(), String> {
        // The document is the collection; rewriting it drops the entry.
        self.write_document(snapshot).await
    }
}

/// Keyed key-value backend, one entry per job under `job:<id>`.
pub struct RedisStore {
    connection: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn load(&self) -> Vec<Job> {
        use redis::AsyncCommands;
        let mut conn = self.connection.clone();
        let keys: Vec<String> = match conn.keys("job:*").await {
            Ok(keys) => keys,
            Err(_) => return Vec::new(),
        };
        let mut jobs = Vec::new();
        for key in keys {
            if let Ok(Some(text)) = conn.get::<_, Option<String>>(&key).await {
                if let Ok(job) = serde_json::from_str::<Job>(&text) {
                    jobs.push(job);
                }
            }
        }
        jobs
    }

    async fn save(&self, changed: &Job, _snapshot: &[Job]) -> Result<(), String> {
        use redis::AsyncCommands;
        let mut conn = self.connection.clone();
        let text = serde_json::to_string(changed).map_err(|e| e.to_string())?;
        conn.set::<_, _, ()>(format!("job:{}", changed.id), text)
            .await
            .map_err(|e| e.to_string())
    }

    async fn remove(&self, id: &str, _snapshot: &[Job]) -> Result<(), String> {
        use redis::AsyncCommands;
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(format!("job:{id}"))
            .await
            .map_err(|e| e.to_string())
    }
}

/// Counters always retained by the periodic memory-reduction pass.
const ESSENTIAL_METRICS: &[&str] = &[
    "jobs_created_total",
    "jobs_completed_total",
    "jobs_cancelled_total",
    "jobs_cleaned_total",
];

pub struct JobManager {
    jobs: Mutex<HashMap<String, (Job, Arc<AtomicBool>)>>,
    store: Box<dyn JobStore>,
    ttl: Duration,
    cleanup_interval: Duration,
    save_errors: AtomicU64,
    metrics: Mutex<HashMap<String, u64>>,
}

impl JobManager {
    /// Build against the backend selected by the settings and load surviving
    /// jobs from it.
    pub async fn from_settings(settings: &Settings) -> Self {
        let store: Box<dyn JobStore> = match &settings.redis_url {
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => {
                    tracing::info!("job persistence: key-value backend");
                    Box::new(store)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "key-value backend unavailable, using JSON file");
                    Box::new(JsonFileStore::new(settings.jobs_path()))
                }
            },
            None => Box::new(JsonFileStore::new(settings.jobs_path())),
        };
        Self::with_store(store, settings.jobs_ttl, settings.jobs_cleanup_interval).await
    }

    pub async fn with_store(
        store: Box<dyn JobStore>,
        ttl: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        let manager = Self {
            jobs: Mutex::new(HashMap::new()),
            store,
            ttl,
            cleanup_interval,
            save_errors: AtomicU64::new(0),
            metrics: Mutex::new(HashMap::new()),
        };
        let loaded = manager.store.load().await;
        let mut jobs = manager.jobs.lock().unwrap_or_else(|p| p.into_inner());
        for job in loaded {
            if !expired(&job, manager.ttl) {
                jobs.insert(job.id.clone(), (job, Arc::new(AtomicBool::new(false))));
            }
        }
        drop(jobs);
        manager
    }

    /// Register a new pending job and persist it.
    pub async fn create(&self, sources: Vec<String>) -> Job {
        let job = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            let mut id = format!("job_{}", (epoch_secs() * 1000.0) as u64);
            let mut suffix = 0;
            while jobs.contains_key(&id) {
                suffix += 1;
                id = format!("job_{}_{suffix}", (epoch_secs() * 1000.0) as u64);
            }
            let job = Job::new(id.clone(), sources);
            jobs.insert(id, (job.clone(), Arc::new(AtomicBool::new(false))));
            job
        };
        self.persist(&job).await;
        self.inc_metric("jobs_created_total", 1);
        tracing::info!(job_id = %job.id, sources = job.sources.len(), "job created");
        job
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .map(|(job, _)| job.clone())
    }

    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|(job, _)| job.clone())
            .collect();
        jobs.sort_by(|a, b| {
            a.started_at
                .partial_cmp(&b.started_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        jobs
    }

    /// The cooperative cancel flag observed by the run driving this job.
    pub fn cancel_flag(&self, id: &str) -> Option<Arc<AtomicBool>> {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .map(|(_, flag)| flag.clone())
    }

    /// Request cancellation. Returns false for unknown or already-terminal
    /// jobs. The run observes the flag at its next checkpoint.
    pub async fn cancel(&self, id: &str) -> bool {
        let flag = {
            let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            match jobs.get(id) {
                Some((job, flag)) if !job.status.is_terminal() => Some(flag.clone()),
                _ => None,
            }
        };
        match flag {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                self.inc_metric("jobs_cancelled_total", 1);
                tracing::info!(job_id = id, "job cancel requested");
                true
            }
            None => false,
        }
    }

    pub async fn delete(&self, id: &str) -> bool {
        let snapshot = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            if jobs.remove(id).is_none() {
                return false;
            }
            jobs.values().map(|(job, _)| job.clone()).collect::<Vec<_>>()
        };
        if let Err(err) = self.store.remove(id, &snapshot).await {
            self.save_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(job_id = id, error = %err, "job removal not persisted");
        }
        tracing::info!(job_id = id, "job deleted");
        true
    }

    /// Apply a mutation and persist the result. Progress is clamped so it
    /// never decreases while running.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let updated = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            let (job, _) = jobs.get_mut(id)?;
            let previous_progress = job.progress;
            mutate(job);
            if job.status == JobStatus::Running {
                job.progress = job.progress.max(previous_progress);
            }
            job.clone()
        };
        self.persist(&updated).await;
        Some(updated)
    }

    async fn persist(&self, job: &Job) {
        let snapshot: Vec<Job> = self
            .jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|(job, _)| job.clone())
            .collect();
        if let Err(err) = self.store.save(job, &snapshot).await {
            self.save_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(job_id = %job.id, error = %err, "job save failed");
        }
    }

    /// Evict expired terminal jobs. Returns how many were removed.
    pub async fn cleanup_now(&self) -> usize {
        let expired_ids: Vec<String> = {
            let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
            jobs.values()
                .filter(|(job, _)| expired(job, self.ttl))
                .map(|(job, _)| job.id.clone())
                .collect()
        };
        let mut removed = 0;
        for id in expired_ids {
            if self.delete(&id).await {
                removed += 1;
            }
        }
        if removed > 0 {
            self.inc_metric("jobs_cleaned_total", removed as u64);
            tracing::info!(removed, ttl_secs = self.ttl.as_secs(), "expired jobs cleaned");
        }
        removed
    }

    /// Background eviction loop; every 10th cycle also trims non-essential
    /// metric counters.
    pub async fn run_cleanup_loop(self: Arc<Self>) {
        let interval = self.cleanup_interval.max(Duration::from_secs(60));
        let mut cycles: u64 = 0;
        loop {
            tokio::time::sleep(interval).await;
            self.cleanup_now().await;
            cycles += 1;
            if cycles % 10 == 0 {
                self.trim_metrics();
            }
        }
    }

    fn trim_metrics(&self) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|p| p.into_inner());
        if metrics.len() > 50 {
            metrics.retain(|name, _| ESSENTIAL_METRICS.contains(&name.as_str()));
        }
    }

    fn inc_metric(&self, name: &str, value: u64) {
        *self
            .metrics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(name.to_string())
            .or_default() += value;
    }

    pub fn metrics(&self) -> HashMap<String, u64> {
        self.metrics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn save_errors(&self) -> u64 {
        self.save_errors.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("jobs", &self.jobs.lock().map(|j| j.len()).unwrap_or(0))
            .finish()
    }
}

fn expired(job: &Job, ttl: Duration) -> bool {
    if !job.status.is_terminal() {
        return false;
    }
    match job.finished_at {
        Some(finished_at) => epoch_secs() - finished_at > ttl.as_secs_f64(),
        None => false,
    }
}
