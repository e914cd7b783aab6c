//! REST/SSE/WebSocket boundary, versioned under `/api/v1`.

mod routes;
mod stream;

use crate::config::Settings;
use crate::discovery::DiscoveryManager;
use crate::events::{EventBus, EventStore};
use crate::fetch::Fetcher;
use crate::jobs::JobManager;
use crate::merger::{Merger, MergerConfig};
use crate::output::RunLog;
use crate::processor::ConfigProcessor;
use crate::sources::SourceManager;
use crate::time::epoch_secs;
use crate::validator::SourceValidator;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower_http::cors::CorsLayer;

/// Boundary rate limit: sliding window per IP and per tenant.
const BOUNDARY_WINDOW: Duration = Duration::from_secs(10);
const BOUNDARY_MAX_REQUESTS: usize = 30;

/// Everything the handlers need, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub sources: Arc<SourceManager>,
    pub fetcher: Arc<Fetcher>,
    pub validator: Arc<SourceValidator>,
    pub processor: Arc<ConfigProcessor>,
    pub merger: Arc<Merger>,
    pub discovery: Arc<DiscoveryManager>,
    pub bus: Arc<EventBus>,
    pub store: Arc<EventStore>,
    pub jobs: Arc<JobManager>,
    pub run_log: Arc<RunLog>,
    pub limiter: Arc<BoundaryLimiter>,
}

/// Wire the full component graph from settings.
pub async fn build_state(settings: Settings, sources_config: Option<PathBuf>) -> AppState {
    let settings = Arc::new(settings);
    let store = Arc::new(EventStore::new(
        settings.event_log_path(),
        settings.event_sample_rate,
    ));
    let bus = Arc::new(EventBus::new().with_store(store.clone()));
    let sources = Arc::new(match sources_config {
        Some(path) => SourceManager::load(path),
        None => SourceManager::load("config/sources.yaml"),
    });
    let fetcher = Arc::new(Fetcher::new(settings.fetcher.clone()));
    let validator = Arc::new(SourceValidator::new(&settings.fetcher.user_agent));
    let processor = Arc::new(ConfigProcessor::new());
    let run_log = Arc::new(RunLog::new(settings.runs_log_path()));
    let merger = Arc::new(
        Merger::new(
            sources.clone(),
            fetcher.clone(),
            validator.clone(),
            processor.clone(),
            bus.clone(),
            MergerConfig {
                max_concurrent: settings.fetcher.max_concurrent,
                ..MergerConfig::default()
            },
        )
        .with_run_log(run_log.clone()),
    );
    let discovery = Arc::new(DiscoveryManager::new(&settings.fetcher.user_agent));
    let jobs = Arc::new(JobManager::from_settings(&settings).await);

    AppState {
        settings,
        sources,
        fetcher,
        validator,
        processor,
        merger,
        discovery,
        bus,
        store,
        jobs,
        run_log,
        limiter: Arc::new(BoundaryLimiter::new(BOUNDARY_WINDOW, BOUNDARY_MAX_REQUESTS)),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(routes::health))
        .route("/api/v1/ready", get(routes::ready))
        .route("/api/v1/limits", get(routes::limits))
        .route("/api/v1/run/merge", post(routes::run_merge))
        .route("/api/v1/sub/raw", get(routes::sub_raw))
        .route("/api/v1/sub/base64", get(routes::sub_base64))
        .route("/api/v1/sub/singbox", get(routes::sub_singbox))
        .route("/api/v1/sub/report", get(routes::sub_report))
        .route("/api/v1/validate", post(routes::validate))
        .route("/api/v1/format", post(routes::format_configs))
        .route("/api/v1/filter", post(routes::filter_configs))
        .route("/api/v1/score", post(routes::score_configs))
        .route("/api/v1/export", post(routes::export))
        .route("/api/v1/discover", get(routes::discover))
        .route("/api/v1/stats", get(routes::stats))
        .route("/api/v1/runs", get(routes::runs))
        .route("/api/v1/events", get(routes::events))
        .route("/api/v1/events/stream", get(stream::sse_events))
        .route("/api/v1/events/ws", get(stream::ws_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the boundary until the process is stopped.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "api listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Sliding-window admission for the HTTP boundary, keyed by client IP and by
/// tenant. Anonymous callers share one tenant bucket.
pub struct BoundaryLimiter {
    window: Duration,
    max_requests: usize,
    by_ip: Mutex<HashMap<String, VecDeque<f64>>>,
    by_tenant: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl BoundaryLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            by_ip: Mutex::new(HashMap::new()),
            by_tenant: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, ip: &str, tenant: Option<&str>) -> bool {
        let now = epoch_secs();
        let tenant_key = tenant.unwrap_or("__no_tenant__");
        let ip_ok = Self::admit(&self.by_ip, ip, now, self.window, self.max_requests, false);
        let tenant_ok = Self::admit(
            &self.by_tenant,
            tenant_key,
            now,
            self.window,
            self.max_requests,
            false,
        );
        if !(ip_ok && tenant_ok) {
            return false;
        }
        Self::admit(&self.by_ip, ip, now, self.window, self.max_requests, true);
        Self::admit(
            &self.by_tenant,
            tenant_key,
            now,
            self.window,
            self.max_requests,
            true,
        )
    }

    fn admit(
        buckets: &Mutex<HashMap<String, VecDeque<f64>>>,
        key: &str,
        now: f64,
        window: Duration,
        max_requests: usize,
        record: bool,
    ) -> bool {
        let mut buckets = buckets.lock().unwrap_or_else(|p| p.into_inner());
        let history = buckets.entry(key.to_string()).or_default();
        let cutoff = now - window.as_secs_f64();
        while history.front().is_some_and(|&t| t < cutoff) {
            history.pop_front();
        }
        if history.len() >= max_requests {
            return false;
        }
        if record {
            history.push_back(now);
        }
        true
    }
}

/// Resolve the tenant from `TENANT_TOKENS`. Two forms are supported:
/// a token mapping (`tenantA:keyA,tenantB:keyB`) resolved from the supplied
/// token, and an allowlist (`tenantA,tenantB`) resolved from an explicit
/// `x-tenant` header or `tenant` query parameter.
pub fn tenant_from_request(
    settings: &Settings,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Option<String> {
    let mapping = settings.tenant_tokens.as_deref()?;
    let entries: Vec<&str> = mapping
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .collect();

    if entries.iter().any(|e| e.contains(':')) {
        let token = header_or_query(headers, query, "x-api-token", "token")?;
        for entry in entries {
            if let Some((tenant, key)) = entry.split_once(':') {
                if key == token {
                    return Some(tenant.to_string());
                }
            }
        }
        return None;
    }

    let tenant = header_or_query(headers, query, "x-tenant", "tenant")?;
    entries.contains(&tenant.as_str()).then_some(tenant)
}

/// Bearer-token gate for the REST surface; open when `API_TOKEN` is unset.
pub fn check_token(
    settings: &Settings,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), StatusCode> {
    let Some(expected) = settings.api_token.as_deref() else {
        return Ok(());
    };
    match header_or_query(headers, query, "x-api-token", "token") {
        Some(supplied) if supplied == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn header_or_query(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    header_name: &str,
    query_name: &str,
) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get(query_name).cloned())
}

/// Artifact directory for the calling tenant.
pub fn tenant_output_dir(
    settings: &Settings,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> PathBuf {
    match tenant_from_request(settings, headers, query) {
        Some(tenant) => settings.output_dir.join("tenants").join(tenant),
        None => settings.output_dir.clone(),
    }
}

/// Convenience extractor payload used by most handlers.
pub(crate) type QueryMap = Query<HashMap<String, String>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(tenants: Option<&str>, token: Option<&str>) -> Settings {
        Settings {
            tenant_tokens: tenants.map(str::to_string),
            api_token: token.map(str::to_string),
            ..Settings::default()
        }
    }

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, value.parse().unwrap());
        headers
    }

    #[test]
    fn boundary_limiter_enforces_window() {
        let limiter = BoundaryLimiter::new(Duration::from_secs(10), 3);
        for _ in 0..3 {
            assert!(limiter.allow("1.2.3.4", None));
        }
        assert!(!limiter.allow("1.2.3.4", None), "4th request denied");
        // A different IP still shares the anonymous tenant bucket.
        assert!(!limiter.allow("5.6.7.8", None));
    }

    #[test]
    fn boundary_limiter_separates_tenants() {
        let limiter = BoundaryLimiter::new(Duration::from_secs(10), 2);
        assert!(limiter.allow("1.1.1.1", Some("a")));
        assert!(limiter.allow("1.1.1.1", Some("b")));
        // Same IP: third request over the per-IP cap.
        assert!(!limiter.allow("1.1.1.1", Some("c")));
        // Different IP, tenant "a" has one slot left.
        assert!(limiter.allow("2.2.2.2", Some("a")));
        assert!(!limiter.allow("3.3.3.3", Some("a")));
    }

    #[test]
    fn tenant_mapping_form_resolves_by_token() {
        let settings = settings_with(Some("alpha:k1,beta:k2"), None);
        let query = HashMap::new();

        let headers = headers_with("x-api-token", "k2");
        assert_eq!(
            tenant_from_request(&settings, &headers, &query),
            Some("beta".to_string())
        );

        let headers = headers_with("x-api-token", "wrong");
        assert_eq!(tenant_from_request(&settings, &headers, &query), None);
    }

    #[test]
    fn tenant_allowlist_form_resolves_by_name() {
        let settings = settings_with(Some("alpha,beta"), None);
        let query = HashMap::new();

        let headers = headers_with("x-tenant", "alpha");
        assert_eq!(
            tenant_from_request(&settings, &headers, &query),
            Some("alpha".to_string())
        );

        let headers = headers_with("x-tenant", "gamma");
        assert_eq!(tenant_from_request(&settings, &headers, &query), None);
    }

    #[test]
    fn token_gate_is_open_without_configuration() {
        let settings = settings_with(None, None);
        assert!(check_token(&settings, &HeaderMap::new(), &HashMap::new()).is_ok());

        let guarded = settings_with(None, Some("secret"));
        assert_eq!(
            check_token(&guarded, &HeaderMap::new(), &HashMap::new()),
            Err(StatusCode::UNAUTHORIZED)
        );
        let headers = headers_with("x-api-token", "secret");
        assert!(check_token(&guarded, &headers, &HashMap::new()).is_ok());
    }

    #[test]
    fn tenant_dir_nests_under_output() {
        let settings = settings_with(Some("alpha:k1"), None);
        let headers = headers_with("x-api-token", "k1");
        let dir = tenant_output_dir(&settings, &headers, &HashMap::new());
        assert!(dir.ends_with("tenants/alpha"));

        let anon = tenant_output_dir(&settings, &HeaderMap::new(), &HashMap::new());
        assert_eq!(anon, settings.output_dir);
    }
}
