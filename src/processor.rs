//! Per-line configuration processing: validation, deduplication, protocol
//! detection, endpoint extraction, and quality scoring.

use crate::content::decode_base64_permissive;
use crate::protocol::Protocol;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

const MIN_CONFIG_LEN: usize = 8;
const MAX_CONFIG_LEN: usize = 10_000;

/// URI prefixes the processor accepts. Anything else is rejected before
/// protocol detection, so an emitted configuration is never `unknown`.
const ACCEPTED_PREFIXES: &[&str] = &[
    "vmess://",
    "vless://",
    "trojan://",
    "ss://",
    "ssr://",
    "hysteria://",
    "hysteria2://",
    "tuic://",
];

/// One accepted proxy configuration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VpnConfiguration {
    pub uri: String,
    pub protocol: Protocol,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub source_url: Option<String>,
    pub quality_score: f64,
    pub error_count: u32,
    pub last_tested: Option<f64>,
    pub is_reachable: Option<bool>,
}

/// Quality-bucket counts over a batch of configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QualityDistribution {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub poor: usize,
}

/// Parses and deduplicates raw configuration lines.
///
/// The dedup set is shared across concurrent workers; insert-and-test happens
/// under one lock so the first occurrence always wins.
pub struct ConfigProcessor {
    seen: Mutex<HashSet<String>>,
}

impl Default for ConfigProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigProcessor {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Process one candidate line. Returns `None` for malformed lines and
    /// duplicates; both are silent by design (no log spam on bulk sources).
    pub fn process(&self, line: &str, source_url: Option<&str>) -> Option<VpnConfiguration> {
        let uri = line.trim();
        if !Self::is_valid(uri) {
            return None;
        }

        // Atomic insert-and-test; a second occurrence observes `false`.
        if !self
            .seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(uri.to_string())
        {
            return None;
        }

        let protocol = Protocol::from_uri(uri);
        let (host, port) = extract_endpoint(uri, protocol);
        Some(VpnConfiguration {
            uri: uri.to_string(),
            protocol,
            host,
            port,
            source_url: source_url.map(str::to_string),
            quality_score: quality_score(uri, protocol),
            error_count: 0,
            last_tested: None,
            is_reachable: None,
        })
    }

    fn is_valid(uri: &str) -> bool {
        if uri.len() < MIN_CONFIG_LEN || uri.len() > MAX_CONFIG_LEN {
            return false;
        }
        let lower = uri.to_ascii_lowercase();
        ACCEPTED_PREFIXES
            .iter()
            .any(|prefix| lower.starts_with(prefix) && uri.len() > prefix.len())
    }

    /// Number of distinct configurations seen so far.
    pub fn processed_count(&self) -> usize {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Forget all dedup state. Called at the start of a run so identical
    /// inputs always produce identical outputs.
    pub fn clear(&self) {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn protocol_distribution(configs: &[VpnConfiguration]) -> HashMap<String, usize> {
        let mut distribution = HashMap::new();
        for config in configs {
            *distribution.entry(config.protocol.to_string()).or_default() += 1;
        }
        distribution
    }

    pub fn quality_distribution(configs: &[VpnConfiguration]) -> QualityDistribution {
        let mut distribution = QualityDistribution::default();
        for config in configs {
            match config.quality_score {
                s if s >= 0.9 => distribution.excellent += 1,
                s if s >= 0.7 => distribution.good += 1,
                s if s >= 0.5 => distribution.fair += 1,
                _ => distribution.poor += 1,
            }
        }
        distribution
    }
}

impl std::fmt::Debug for ConfigProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigProcessor")
            .field("processed", &self.processed_count())
            .finish()
    }
}

/// Deterministic quality score: protocol preference plus a length bonus,
/// capped at 1.0. Content-only; no network I/O.
pub fn quality_score(uri: &str, protocol: Protocol) -> f64 {
    let score = protocol.base_quality() + (uri.len() as f64 / 1000.0).min(0.2);
    score.min(1.0)
}

/// Best-effort server endpoint extraction. Failure to extract never rejects
/// the configuration; the raw URI is preserved for dedup and serialization.
fn extract_endpoint(uri: &str, protocol: Protocol) -> (Option<String>, Option<u16>) {
    match protocol {
        Protocol::Vmess => vmess_endpoint(uri),
        Protocol::Shadowsocks => shadowsocks_endpoint(uri),
        _ => authority_endpoint(uri),
    }
}

/// Endpoint from an authority-form URI (vless, trojan, tuic, hysteria).
/// Percent-encoded user-info is handled by the URL parser.
fn authority_endpoint(uri: &str) -> (Option<String>, Option<u16>) {
    match url::Url::parse(uri) {
        Ok(parsed) => (
            parsed.host_str().map(str::to_string),
            parsed.port(),
        ),
        Err(_) => (None, None),
    }
}

/// vmess URIs carry a base64-encoded JSON object with `add` and `port`.
fn vmess_endpoint(uri: &str) -> (Option<String>, Option<u16>) {
    let Some(payload) = uri.get("vmess://".len()..) else {
        return (None, None);
    };
    let Some(decoded) = decode_base64_permissive(payload) else {
        return (None, None);
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&decoded) else {
        return (None, None);
    };
    let host = value
        .get("add")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let port = match value.get("port") {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    (host, port)
}

/// Shadowsocks comes in SIP002 form (`ss://base64(method:pass)@host:port`)
/// and legacy form (`ss://base64(method:pass@host:port)`).
fn shadowsocks_endpoint(uri: &str) -> (Option<String>, Option<u16>) {
    let Some(payload) = uri.get("ss://".len()..) else {
        return (None, None);
    };
    let payload = payload.split(['#', '?']).next().unwrap_or(payload);
    if payload.contains('@') {
        return authority_endpoint(uri);
    }
    match legacy_shadowsocks_endpoint(payload) {
        Some((host, port)) => (Some(host), Some(port)),
        None => (None, None),
    }
}

fn legacy_shadowsocks_endpoint(payload: &str) -> Option<(String, u16)> {
    let decoded = decode_base64_permissive(payload)?;
    let text = String::from_utf8(decoded).ok()?;
    let (_, endpoint) = text.rsplit_once('@')?;
    let (host, port) = endpoint.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    #[test]
    fn accepts_valid_line_and_scores_it() {
        let processor = ConfigProcessor::new();
        let config = processor
            .process("vless://uuid@host.example:443?security=tls#tag", None)
            .expect("accepted");
        assert_eq!(config.protocol, Protocol::Vless);
        assert_eq!(config.host.as_deref(), Some("host.example"));
        assert_eq!(config.port, Some(443));
        assert!(config.quality_score > 0.9);
    }

    #[test]
    fn rejects_short_long_and_foreign_lines() {
        let processor = ConfigProcessor::new();
        assert!(processor.process("ss://a", None).is_none(), "below minimum length");
        assert!(processor.process("<script>alert(1)</script>", None).is_none());
        assert!(processor.process("http://example.com/page", None).is_none());
        let oversized = format!("vmess://{}", "x".repeat(MAX_CONFIG_LEN));
        assert!(processor.process(&oversized, None).is_none());
    }

    #[test]
    fn rejects_prefix_only_lines() {
        let processor = ConfigProcessor::new();
        assert!(processor.process("hysteria2://", None).is_none());
        assert!(processor.process("vmess://", None).is_none());
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let processor = ConfigProcessor::new();
        assert!(processor.process("vmess://payload-abc", Some("https://s1")).is_some());
        assert!(
            processor.process("  vmess://payload-abc  ", Some("https://s2")).is_none(),
            "whitespace-differing duplicate must be rejected"
        );
        assert_eq!(processor.processed_count(), 1);
    }

    #[test]
    fn processing_twice_equals_processing_once() {
        let lines = ["vmess://aaa111", "vless://bbb222", "trojan://ccc333"];
        let processor = ConfigProcessor::new();
        let first: Vec<_> = lines.iter().filter_map(|l| processor.process(l, None)).collect();
        let second: Vec<_> = lines.iter().filter_map(|l| processor.process(l, None)).collect();
        assert_eq!(first.len(), 3);
        assert!(second.is_empty());
    }

    #[test]
    fn clear_resets_dedup_state() {
        let processor = ConfigProcessor::new();
        assert!(processor.process("tuic://uuid:pass@h:443", None).is_some());
        processor.clear();
        assert!(processor.process("tuic://uuid:pass@h:443", None).is_some());
    }

    #[test]
    fn emitted_protocol_is_never_unknown() {
        let processor = ConfigProcessor::new();
        let lines = [
            "vmess://abc123",
            "vless://abc123",
            "trojan://abc123",
            "ss://abc123",
            "ssr://abc123",
            "hysteria://abc123",
            "hysteria2://abc123",
            "tuic://abc123",
        ];
        for line in lines {
            let config = processor.process(line, None).expect("accepted");
            assert_ne!(config.protocol, Protocol::Unknown, "line {line}");
        }
    }

    #[test]
    fn quality_score_is_deterministic_and_capped() {
        let uri = format!("vless://{}", "a".repeat(500));
        let a = quality_score(&uri, Protocol::Vless);
        let b = quality_score(&uri, Protocol::Vless);
        assert_eq!(a, b);
        assert!(a <= 1.0);

        // Base 0.8 plus 20/1000 length bonus.
        let short = "vmess://twenty-chars";
        let expected = 0.8 + short.len() as f64 / 1000.0;
        assert!((quality_score(short, Protocol::Vmess) - expected).abs() < 1e-9);
    }

    #[test]
    fn vmess_endpoint_from_base64_json() {
        let blob = STANDARD.encode(r#"{"add":"srv.example","port":"8443","id":"x"}"#);
        let (host, port) = vmess_endpoint(&format!("vmess://{blob}"));
        assert_eq!(host.as_deref(), Some("srv.example"));
        assert_eq!(port, Some(8443));
    }

    #[test]
    fn vmess_endpoint_tolerates_undecodable_payload() {
        let (host, port) = vmess_endpoint("vmess://!!!notb64!!!");
        assert_eq!(host, None);
        assert_eq!(port, None);
        // And the line itself is still accepted.
        let processor = ConfigProcessor::new();
        assert!(processor.process("vmess://!!!notb64!!!", None).is_some());
    }

    #[test]
    fn shadowsocks_legacy_form_decodes() {
        let blob = STANDARD.encode("aes-256-gcm:secret@ss.example:8388");
        let (host, port) = shadowsocks_endpoint(&format!("ss://{blob}#tag"));
        assert_eq!(host.as_deref(), Some("ss.example"));
        assert_eq!(port, Some(8388));
    }

    #[test]
    fn shadowsocks_sip002_form_uses_authority() {
        let userinfo = STANDARD.encode("aes-256-gcm:secret");
        let uri = format!("ss://{userinfo}@ss2.example:8389#tag");
        let (host, port) = shadowsocks_endpoint(&uri);
        assert_eq!(host.as_deref(), Some("ss2.example"));
        assert_eq!(port, Some(8389));
    }

    #[test]
    fn distributions_bucket_by_protocol_and_quality() {
        let processor = ConfigProcessor::new();
        let configs: Vec<_> = [
            "vless://abcdef",
            "vless://ghijkl",
            "ssr://abcdef",
        ]
        .iter()
        .filter_map(|l| processor.process(l, None))
        .collect();

        let protocols = ConfigProcessor::protocol_distribution(&configs);
        assert_eq!(protocols.get("vless"), Some(&2));
        assert_eq!(protocols.get("shadowsocksr"), Some(&1));

        let quality = ConfigProcessor::quality_distribution(&configs);
        assert_eq!(quality.excellent, 2);
        assert_eq!(quality.fair, 1);
    }
}
