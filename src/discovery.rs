//! Optional discovery of new sources: a built-in whitelist of public raw
//! lists plus a budgeted repository search, with structural and content
//! screening before anything is handed to the source manager.

use crate::content;
use crate::sources::is_valid_url;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(6 * 3600);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Search API quota floor; below this the search leg backs off entirely.
const RATE_LIMIT_FLOOR: u64 = 5;

/// Repositories inspected per search query.
const REPOS_PER_QUERY: usize = 5;

/// Well-known public raw subscription lists.
const WELL_KNOWN_SOURCES: &[&str] = &[
    "https://raw.githubusercontent.com/freefq/free/master/v2",
    "https://raw.githubusercontent.com/aiboboxx/v2rayfree/main/v2",
    "https://raw.githubusercontent.com/mahdibland/V2RayAggregator/master/sub/sub_merge.txt",
    "https://raw.githubusercontent.com/peasoft/NoMoreWalls/master/list.txt",
];

/// Queries sent to the repository search API, bounded per run.
const SEARCH_QUERIES: &[&str] = &[
    "v2ray subscription in:readme",
    "clash subscription yaml",
    "shadowsocks subscription base64",
];

/// File names subscription repos conventionally serve.
const SUBSCRIPTION_PATTERNS: &[&str] = &["sub.txt", "subscription.txt", "configs.txt"];

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoveryStatistics {
    pub discovered_total: usize,
    pub last_discovery_age_seconds: Option<f64>,
    pub search_rate_limit_remaining: u64,
}

pub struct DiscoveryManager {
    client: reqwest::Client,
    api_base: String,
    raw_base: String,
    well_known: Vec<String>,
    interval: Duration,
    discovered: Mutex<HashSet<String>>,
    last_discovery: Mutex<Option<Instant>>,
    rate_limit_remaining: Mutex<u64>,
}

impl DiscoveryManager {
    pub fn new(user_agent: &str) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: "https://api.github.com".to_string(),
            raw_base: "https://raw.githubusercontent.com".to_string(),
            well_known: WELL_KNOWN_SOURCES.iter().map(|s| s.to_string()).collect(),
            interval: DEFAULT_INTERVAL,
            discovered: Mutex::new(HashSet::new()),
            last_discovery: Mutex::new(None),
            rate_limit_remaining: Mutex::new(60),
        }
    }

    /// Point the search/raw legs somewhere else (tests).
    pub fn with_endpoints(mut self, api_base: impl Into<String>, raw_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.raw_base = raw_base.into();
        self
    }

    pub fn with_well_known(mut self, urls: Vec<String>) -> Self {
        self.well_known = urls;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Whether enough time has passed since the last discovery run.
    pub fn should_discover(&self) -> bool {
        self.last_discovery
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .map_or(true, |last| last.elapsed() >= self.interval)
    }

    /// Discover new candidate sources. Every returned URL passed structural
    /// validation and a content screen, and was not seen by a previous run.
    pub async fn discover(&self) -> Vec<String> {
        *self
            .last_discovery
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());

        let mut candidates: Vec<String> = self.well_known.clone();
        candidates.extend(self.search_repositories().await);

        let mut fresh = Vec::new();
        for url in candidates {
            if !structurally_valid(&url) {
                continue;
            }
            if self
                .discovered
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .contains(&url)
            {
                continue;
            }
            if self.content_screen(&url).await {
                self.discovered
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(url.clone());
                fresh.push(url);
            }
        }
        tracing::info!(count = fresh.len(), "discovery finished");
        fresh
    }

    /// Budgeted repository search. Backs off entirely when the remaining API
    /// quota is below the floor.
    async fn search_repositories(&self) -> Vec<String> {
        if !self.check_rate_limit().await {
            tracing::warn!("search API quota low, skipping repository search");
            return Vec::new();
        }

        let mut found = Vec::new();
        for query in SEARCH_QUERIES {
            let url = format!("{}/search/repositories", self.api_base);
            let response = self
                .client
                .get(&url)
                .query(&[
                    ("q", *query),
                    ("sort", "updated"),
                    ("order", "desc"),
                    ("per_page", "30"),
                ])
                .header("Accept", "application/vnd.github.v3+json")
                .send()
                .await;

            let response = match response {
                Ok(response) if response.status().as_u16() == 200 => response,
                Ok(response) if response.status().as_u16() == 403 => {
                    tracing::warn!("search API rate limited mid-run");
                    break;
                }
                Ok(_) | Err(_) => continue,
            };
            self.note_rate_limit(&response);

            let Ok(body) = response.json::<serde_json::Value>().await else {
                continue;
            };
            let repos = body
                .get("items")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get("full_name").and_then(|v| v.as_str()))
                        .take(REPOS_PER_QUERY)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            for repo in repos {
                for pattern in SUBSCRIPTION_PATTERNS {
                    found.push(format!("{}/{repo}/master/{pattern}", self.raw_base));
                }
            }
        }
        found
    }

    async fn check_rate_limit(&self) -> bool {
        let url = format!("{}/rate_limit", self.api_base);
        if let Ok(response) = self.client.get(&url).send().await {
            if let Ok(body) = response.json::<serde_json::Value>().await {
                if let Some(remaining) = body
                    .pointer("/resources/search/remaining")
                    .and_then(|v| v.as_u64())
                {
                    *self
                        .rate_limit_remaining
                        .lock()
                        .unwrap_or_else(|p| p.into_inner()) = remaining;
                    return remaining >= RATE_LIMIT_FLOOR;
                }
            }
        }
        // Unknown quota: proceed on the last observed value.
        *self
            .rate_limit_remaining
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            >= RATE_LIMIT_FLOOR
    }

    fn note_rate_limit(&self, response: &reqwest::Response) {
        if let Some(remaining) = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
        {
            *self
                .rate_limit_remaining
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = remaining;
        }
    }

    /// A candidate must actually serve something that looks like proxy
    /// configuration material.
    async fn content_screen(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => !content::detect_protocols(&body).is_empty(),
                Err(_) => false,
            },
            _ => false,
        }
    }

    pub fn discovered_sources(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .discovered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect();
        urls.sort();
        urls
    }

    pub fn clear_discovered(&self) {
        self.discovered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    pub fn statistics(&self) -> DiscoveryStatistics {
        DiscoveryStatistics {
            discovered_total: self
                .discovered
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .len(),
            last_discovery_age_seconds: self
                .last_discovery
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .map(|last| last.elapsed().as_secs_f64()),
            search_rate_limit_remaining: *self
                .rate_limit_remaining
                .lock()
                .unwrap_or_else(|p| p.into_inner()),
        }
    }
}

impl std::fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("interval", &self.interval)
            .finish()
    }
}

/// Scheme must be http(s) and the host non-empty.
fn structurally_valid(candidate: &str) -> bool {
    if !is_valid_url(candidate) {
        return false;
    }
    url::Url::parse(candidate)
        .ok()
        .and_then(|u| u.host_str().map(|h| !h.is_empty()))
        .unwrap_or(false)
}
