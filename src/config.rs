//! Runtime settings, populated from the environment.
//!
//! A plain record rather than a global: it is built once at startup and
//! handed to the components that need it.

use std::path::PathBuf;
use std::time::Duration;

/// Fetcher tuning knobs.
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub retry_attempts: usize,
    pub retry_delay: Duration,
    pub user_agent: String,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            user_agent: concat!("submerge/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Process-wide settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root for artifacts, the event log and the JSON job store.
    pub output_dir: PathBuf,
    /// Optional bearer token guarding the REST/WebSocket surface.
    pub api_token: Option<String>,
    /// Tenant allowlist (`a,b`) or token mapping (`a:k1,b:k2`).
    pub tenant_tokens: Option<String>,
    /// Key-value job persistence when set; JSON file otherwise.
    pub redis_url: Option<String>,
    pub jobs_ttl: Duration,
    pub jobs_cleanup_interval: Duration,
    /// Sampling rate in [0,1] applied to high-frequency events before they
    /// are persisted. Live listeners always receive them.
    pub event_sample_rate: f64,
    pub fetcher: FetcherSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            api_token: None,
            tenant_tokens: None,
            redis_url: None,
            jobs_ttl: Duration::from_secs(7 * 86_400),
            jobs_cleanup_interval: Duration::from_secs(600),
            event_sample_rate: 1.0,
            fetcher: FetcherSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ttl_days = env_parse("JOBS_TTL_DAYS", 7.0_f64);
        Self {
            output_dir: std::env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            api_token: env_nonempty("API_TOKEN"),
            tenant_tokens: env_nonempty("TENANT_TOKENS"),
            redis_url: env_nonempty("REDIS_URL"),
            jobs_ttl: Duration::from_secs_f64((ttl_days * 86_400.0).max(0.0)),
            jobs_cleanup_interval: Duration::from_secs_f64(
                env_parse("JOBS_CLEANUP_INTERVAL_SEC", 600.0_f64).max(1.0),
            ),
            event_sample_rate: env_parse("EVENT_SAMPLE_RATE", 1.0_f64).clamp(0.0, 1.0),
            fetcher: defaults.fetcher,
        }
    }

    /// Path of the append-only event log.
    pub fn event_log_path(&self) -> PathBuf {
        self.output_dir.join("events.log")
    }

    /// Path of the run summaries log.
    pub fn runs_log_path(&self) -> PathBuf {
        self.output_dir.join("runs.log")
    }

    /// Path of the JSON job store. Falls back to `data/jobs.json` when no
    /// output dir was configured, matching the historical layout.
    pub fn jobs_path(&self) -> PathBuf {
        if std::env::var_os("OUTPUT_DIR").is_some() {
            self.output_dir.join("jobs.json")
        } else {
            PathBuf::from("data/jobs.json")
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
