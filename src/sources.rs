//! Tiered source management: config loading, prioritization, runtime
//! add/remove, quarantine bookkeeping, and statistics.

use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// Priority order for the well-known tiers. Unknown tiers follow in load
/// order; `custom` always comes last.
const TIER_ORDER: &[&str] = &[
    "tier_1_premium",
    "tier_2_reliable",
    "tier_3_bulk",
    "specialized",
    "regional",
    "experimental",
    "emergency_fallback",
];

/// Consecutive validation failures before a source is quarantined.
const QUARANTINE_THRESHOLD: u32 = 5;

/// Recursion bound when digging through nested tier maps for `urls` lists.
const EXTRACT_DEPTH: usize = 5;

/// One configured source.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub url: String,
    pub weight: Option<f64>,
    pub protocols: Option<Vec<String>>,
    pub region: Option<String>,
}

impl Source {
    fn bare(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: None,
            protocols: None,
            region: None,
        }
    }
}

#[derive(Debug, Default)]
struct FailState {
    streak: u32,
    quarantined: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatistics {
    pub total_sources: usize,
    pub tier_count: usize,
    pub tier_info: HashMap<String, usize>,
    pub prioritized_count: usize,
    pub quarantined_count: usize,
}

/// Loads and organizes subscription sources by tier.
pub struct SourceManager {
    /// Tier name → sources, preserving config order within a tier.
    tiers: Mutex<Vec<(String, Vec<Source>)>>,
    failures: Mutex<HashMap<String, FailState>>,
}

impl SourceManager {
    /// Load sources from a YAML config file. Any shape problem falls back to
    /// the minimal embedded list with a single warning; unexpected I/O errors
    /// are treated the same way since the caller cannot do better.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let tiers = match std::fs::read_to_string(path) {
            Ok(text) => match Self::parse_config(&text) {
                Some(tiers) if tiers.iter().any(|(_, sources)| !sources.is_empty()) => {
                    let total: usize = tiers.iter().map(|(_, s)| s.len()).sum();
                    tracing::info!(total, tiers = tiers.len(), config = %path.display(), "loaded sources");
                    tiers
                }
                _ => {
                    tracing::warn!(config = %path.display(), "no valid sources in config, using fallback list");
                    Self::fallback_tiers()
                }
            },
            Err(err) => {
                tracing::warn!(config = %path.display(), error = %err, "config unreadable, using fallback list");
                Self::fallback_tiers()
            }
        };
        Self {
            tiers: Mutex::new(tiers),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Build from an explicit URL list (quick runs, tests).
    pub fn from_urls(urls: Vec<String>) -> Self {
        let sources = urls
            .into_iter()
            .filter(|u| is_valid_url(u))
            .map(Source::bare)
            .collect();
        Self {
            tiers: Mutex::new(vec![("custom".to_string(), sources)]),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn parse_config(text: &str) -> Option<Vec<(String, Vec<Source>)>> {
        let root: serde_yaml::Value = serde_yaml::from_str(text).ok()?;
        let sources = root.get("sources")?.as_mapping()?;
        let mut tiers = Vec::new();
        for (key, value) in sources {
            let Some(tier) = key.as_str() else { continue };
            tiers.push((tier.to_string(), extract_sources(value, 0)));
        }
        Some(tiers)
    }

    fn fallback_tiers() -> Vec<(String, Vec<Source>)> {
        vec![(
            "emergency_fallback".to_string(),
            vec![
                Source::bare("https://raw.githubusercontent.com/freefq/free/master/v2"),
                Source::bare("https://raw.githubusercontent.com/aiboboxx/v2rayfree/main/v2"),
            ],
        )]
    }

    /// All sources, flattened, tier order preserved.
    pub fn all_sources(&self) -> Vec<String> {
        let tiers = self.tiers.lock().unwrap_or_else(|p| p.into_inner());
        tiers
            .iter()
            .flat_map(|(_, sources)| sources.iter().map(|s| s.url.clone()))
            .collect()
    }

    pub fn sources_by_tier(&self, tier: &str) -> Vec<String> {
        let tiers = self.tiers.lock().unwrap_or_else(|p| p.into_inner());
        tiers
            .iter()
            .find(|(name, _)| name == tier)
            .map(|(_, sources)| sources.iter().map(|s| s.url.clone()).collect())
            .unwrap_or_default()
    }

    /// Sources in priority order, quarantined entries omitted.
    pub fn prioritized(&self) -> Vec<String> {
        let tiers = self.tiers.lock().unwrap_or_else(|p| p.into_inner());
        let failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());

        let mut ordered: Vec<&(String, Vec<Source>)> = Vec::with_capacity(tiers.len());
        for tier in TIER_ORDER {
            if let Some(entry) = tiers.iter().find(|(name, _)| name == tier) {
                ordered.push(entry);
            }
        }
        for entry in tiers.iter() {
            if !TIER_ORDER.contains(&entry.0.as_str()) && entry.0 != "custom" {
                ordered.push(entry);
            }
        }
        if let Some(entry) = tiers.iter().find(|(name, _)| name == "custom") {
            ordered.push(entry);
        }

        ordered
            .iter()
            .flat_map(|(_, sources)| sources.iter())
            .filter(|s| !failures.get(&s.url).is_some_and(|f| f.quarantined))
            .map(|s| s.url.clone())
            .collect()
    }

    /// Add runtime sources under the `custom` tier. Invalid or already-known
    /// URLs are skipped. Returns how many were added.
    pub fn add_custom(&self, urls: &[String]) -> usize {
        let mut tiers = self.tiers.lock().unwrap_or_else(|p| p.into_inner());
        let existing: std::collections::HashSet<String> = tiers
            .iter()
            .flat_map(|(_, sources)| sources.iter().map(|s| s.url.clone()))
            .collect();

        if !tiers.iter().any(|(name, _)| name == "custom") {
            tiers.push(("custom".to_string(), Vec::new()));
        }
        let custom = &mut tiers
            .iter_mut()
            .find(|(name, _)| name == "custom")
            .expect("custom tier exists")
            .1;

        let mut added = 0;
        for url in urls {
            if is_valid_url(url) && !existing.contains(url) {
                custom.push(Source::bare(url.clone()));
                added += 1;
            }
        }
        if added > 0 {
            tracing::info!(added, "added custom sources");
        }
        added
    }

    /// Remove sources from every tier. Returns how many entries were dropped.
    pub fn remove(&self, urls: &[String]) -> usize {
        let mut tiers = self.tiers.lock().unwrap_or_else(|p| p.into_inner());
        let mut removed = 0;
        for (_, sources) in tiers.iter_mut() {
            let before = sources.len();
            sources.retain(|s| !urls.contains(&s.url));
            removed += before - sources.len();
        }
        if removed > 0 {
            tracing::info!(removed, "removed sources");
        }
        removed
    }

    /// Record a failed validation. Returns `true` when this failure tips the
    /// source into quarantine.
    pub fn record_failure(&self, url: &str) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let state = failures.entry(url.to_string()).or_default();
        state.streak += 1;
        if !state.quarantined && state.streak >= QUARANTINE_THRESHOLD {
            state.quarantined = true;
            tracing::warn!(url, streak = state.streak, "source quarantined");
            return true;
        }
        false
    }

    /// Record a successful validation, clearing the failure streak.
    pub fn record_success(&self, url: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(state) = failures.get_mut(url) {
            state.streak = 0;
        }
    }

    pub fn is_quarantined(&self, url: &str) -> bool {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(url)
            .is_some_and(|f| f.quarantined)
    }

    /// Manually lift a quarantine.
    pub fn reset_quarantine(&self, url: &str) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        match failures.get_mut(url) {
            Some(state) if state.quarantined => {
                state.quarantined = false;
                state.streak = 0;
                tracing::info!(url, "quarantine reset");
                true
            }
            _ => false,
        }
    }

    pub fn quarantined_count(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|f| f.quarantined)
            .count()
    }

    pub fn statistics(&self) -> SourceStatistics {
        let tiers = self.tiers.lock().unwrap_or_else(|p| p.into_inner());
        let tier_info: HashMap<String, usize> = tiers
            .iter()
            .map(|(name, sources)| (name.clone(), sources.len()))
            .collect();
        let total_sources = tier_info.values().sum();
        drop(tiers);
        SourceStatistics {
            total_sources,
            tier_count: tier_info.len(),
            tier_info,
            prioritized_count: self.prioritized().len(),
            quarantined_count: self.quarantined_count(),
        }
    }
}

impl std::fmt::Debug for SourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceManager")
            .field("total", &self.all_sources().len())
            .finish()
    }
}

/// A tier value is a URL list, a list of `{url, ...}` objects, or a nested
/// map containing an `urls` list in either form. Unknown keys are ignored.
fn extract_sources(value: &serde_yaml::Value, depth: usize) -> Vec<Source> {
    if depth > EXTRACT_DEPTH {
        tracing::warn!("source config nesting too deep, ignoring subtree");
        return Vec::new();
    }
    match value {
        serde_yaml::Value::Sequence(items) => items.iter().filter_map(source_from_item).collect(),
        serde_yaml::Value::Mapping(map) => {
            let mut sources = Vec::new();
            for (key, nested) in map {
                if key.as_str() == Some("urls") {
                    sources.extend(extract_sources(nested, depth + 1));
                } else if nested.is_mapping() {
                    sources.extend(extract_sources(nested, depth + 1));
                }
            }
            sources
        }
        _ => Vec::new(),
    }
}

fn source_from_item(item: &serde_yaml::Value) -> Option<Source> {
    match item {
        serde_yaml::Value::String(url) if is_valid_url(url) => Some(Source::bare(url.clone())),
        serde_yaml::Value::Mapping(_) => {
            let url = item.get("url")?.as_str()?;
            if !is_valid_url(url) {
                return None;
            }
            Some(Source {
                url: url.to_string(),
                weight: item.get("weight").and_then(|v| v.as_f64()),
                protocols: item.get("protocols").and_then(|v| {
                    v.as_sequence().map(|seq| {
                        seq.iter()
                            .filter_map(|p| p.as_str().map(str::to_string))
                            .collect()
                    })
                }),
                region: item
                    .get("region")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            })
        }
        _ => None,
    }
}

/// Structural URL check: absolute http(s) only.
pub fn is_valid_url(url: &str) -> bool {
    let url = url.trim();
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("temp config");
        file.write_all(yaml.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn loads_plain_url_lists() {
        let file = write_config(
            "metadata:\n  version: 2\nsources:\n  tier_1_premium:\n    - https://a.example/sub\n    - https://b.example/sub\n  experimental:\n    - https://x.example/sub\n",
        );
        let manager = SourceManager::load(file.path());
        assert_eq!(manager.all_sources().len(), 3);
        assert_eq!(manager.sources_by_tier("tier_1_premium").len(), 2);
    }

    #[test]
    fn loads_object_lists_with_attributes() {
        let file = write_config(
            "sources:\n  regional:\n    - url: https://asia.example/sub\n      weight: 0.7\n      region: asia\n    - url: ftp://bad.example\n",
        );
        let manager = SourceManager::load(file.path());
        let urls = manager.sources_by_tier("regional");
        assert_eq!(urls, vec!["https://asia.example/sub".to_string()]);
    }

    #[test]
    fn loads_nested_urls_maps() {
        let file = write_config(
            "sources:\n  specialized:\n    shadowsocks:\n      urls:\n        - https://ss.example/sub\n    trojan:\n      urls:\n        - url: https://tr.example/sub\n          weight: 0.9\n",
        );
        let manager = SourceManager::load(file.path());
        let urls = manager.sources_by_tier("specialized");
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn missing_config_falls_back() {
        let manager = SourceManager::load("/definitely/not/there.yaml");
        assert!(!manager.all_sources().is_empty());
        assert!(!manager.sources_by_tier("emergency_fallback").is_empty());
    }

    #[test]
    fn unparseable_config_falls_back() {
        let file = write_config(": not : valid : yaml : [");
        let manager = SourceManager::load(file.path());
        assert!(!manager.sources_by_tier("emergency_fallback").is_empty());
    }

    #[test]
    fn prioritized_follows_tier_order() {
        let file = write_config(
            "sources:\n  experimental:\n    - https://exp.example/sub\n  tier_1_premium:\n    - https://prem.example/sub\n  tier_2_reliable:\n    - https://rel.example/sub\n",
        );
        let manager = SourceManager::load(file.path());
        let prioritized = manager.prioritized();
        assert_eq!(
            prioritized,
            vec![
                "https://prem.example/sub".to_string(),
                "https://rel.example/sub".to_string(),
                "https://exp.example/sub".to_string(),
            ]
        );
    }

    #[test]
    fn quarantine_after_five_failures_and_reset() {
        let manager = SourceManager::from_urls(vec!["https://flaky.example/sub".into()]);
        for i in 0..4 {
            assert!(!manager.record_failure("https://flaky.example/sub"), "failure {i}");
        }
        assert!(manager.record_failure("https://flaky.example/sub"));
        assert!(manager.is_quarantined("https://flaky.example/sub"));
        assert!(manager.prioritized().is_empty(), "quarantined source omitted");

        assert!(manager.reset_quarantine("https://flaky.example/sub"));
        assert_eq!(manager.prioritized().len(), 1);
    }

    #[test]
    fn success_resets_streak() {
        let manager = SourceManager::from_urls(vec!["https://s.example/sub".into()]);
        for _ in 0..4 {
            manager.record_failure("https://s.example/sub");
        }
        manager.record_success("https://s.example/sub");
        for _ in 0..4 {
            assert!(!manager.record_failure("https://s.example/sub"));
        }
        assert!(!manager.is_quarantined("https://s.example/sub"));
    }

    #[test]
    fn add_and_remove_custom_sources() {
        let manager = SourceManager::from_urls(vec!["https://a.example/sub".into()]);
        let added = manager.add_custom(&[
            "https://new.example/sub".to_string(),
            "https://a.example/sub".to_string(), // duplicate
            "not-a-url".to_string(),
        ]);
        assert_eq!(added, 1);
        assert_eq!(manager.all_sources().len(), 2);

        assert_eq!(manager.remove(&["https://new.example/sub".to_string()]), 1);
        assert_eq!(manager.all_sources().len(), 1);
    }

    #[test]
    fn statistics_summarize_tiers() {
        let file = write_config(
            "sources:\n  tier_1_premium:\n    - https://a.example/s\n  tier_3_bulk:\n    - https://b.example/s\n    - https://c.example/s\n",
        );
        let manager = SourceManager::load(file.path());
        let stats = manager.statistics();
        assert_eq!(stats.total_sources, 3);
        assert_eq!(stats.tier_count, 2);
        assert_eq!(stats.tier_info.get("tier_3_bulk"), Some(&2));
        assert_eq!(stats.quarantined_count, 0);
    }
}
