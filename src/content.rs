//! Source payload analysis: body format classification, protocol scanning,
//! and configuration-count estimation.
//!
//! Sources serve raw URI lists, base64 blobs, JSON documents, or Clash-style
//! YAML; everything here is pure and never touches the network.

use crate::protocol::Protocol;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::BTreeSet;

/// Maximum depth when walking JSON/YAML documents for embedded URIs.
const SCAN_DEPTH: usize = 10;

/// JSON keys that commonly hold the configuration array.
const CONFIG_KEYS: &[&str] = &["configs", "servers", "proxies", "outbounds", "inbounds"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Yaml,
    Base64,
    PlainText,
}

/// Classify a payload. JSON wins only if it actually parses; YAML is
/// recognized by list-item / mapping-key markers; base64 requires the
/// whitespace-stripped text to be a non-empty multiple of four that decodes.
pub fn detect_format(content: &str) -> PayloadFormat {
    let trimmed = content.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
            return PayloadFormat::Json;
        }
    }
    if trimmed.lines().any(is_yaml_marker) {
        return PayloadFormat::Yaml;
    }
    if strip_base64(trimmed).is_some() {
        return PayloadFormat::Base64;
    }
    PayloadFormat::PlainText
}

fn is_yaml_marker(line: &str) -> bool {
    let line = line.trim_start();
    if line.starts_with("- ") {
        return true;
    }
    // `key:` at line start, with a plain identifier before the colon.
    match line.split_once(':') {
        Some((key, rest)) => {
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                && (rest.is_empty() || rest.starts_with(' '))
        }
        None => false,
    }
}

fn strip_base64(content: &str) -> Option<String> {
    let stripped: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped.is_empty() || stripped.len() % 4 != 0 {
        return None;
    }
    STANDARD.decode(&stripped).ok()?;
    Some(stripped)
}

/// Decode base64 tolerating missing `=` padding, as seen in vmess bodies and
/// shadowsocks user-info blobs in the wild.
pub fn decode_base64_permissive(input: &str) -> Option<Vec<u8>> {
    let stripped: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped.is_empty() {
        return None;
    }
    let padding = (4 - stripped.len() % 4) % 4;
    let padded = format!("{stripped}{}", "=".repeat(padding));
    STANDARD.decode(padded).ok()
}

/// Protocols referenced anywhere in the payload. Base64 payloads are also
/// scanned decoded; JSON/YAML documents are walked for embedded URI strings.
pub fn detect_protocols(content: &str) -> BTreeSet<Protocol> {
    let mut found = BTreeSet::new();
    scan_lines(content, &mut found);

    match detect_format(content) {
        PayloadFormat::Base64 => {
            if let Some(decoded) = decode_base64_text(content) {
                scan_lines(&decoded, &mut found);
            }
        }
        PayloadFormat::Json => {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(content.trim()) {
                scan_json(&value, 0, &mut found);
            }
        }
        PayloadFormat::Yaml => {
            if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(content) {
                scan_yaml(&value, 0, &mut found);
            }
        }
        PayloadFormat::PlainText => {}
    }
    found
}

fn scan_lines(content: &str, found: &mut BTreeSet<Protocol>) {
    for line in content.lines() {
        let lower = line.trim().to_ascii_lowercase();
        for (protocol, scheme) in Protocol::schemes() {
            if lower.starts_with(scheme) {
                found.insert(protocol);
            }
        }
    }
}

fn scan_string_value(value: &str, found: &mut BTreeSet<Protocol>) {
    let lower = value.to_ascii_lowercase();
    for (protocol, scheme) in Protocol::schemes() {
        if lower.contains(scheme) {
            found.insert(protocol);
        }
    }
}

fn scan_json(value: &serde_json::Value, depth: usize, found: &mut BTreeSet<Protocol>) {
    if depth > SCAN_DEPTH {
        return;
    }
    match value {
        serde_json::Value::String(s) => scan_string_value(s, found),
        serde_json::Value::Array(items) => {
            for item in items {
                scan_json(item, depth + 1, found);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                scan_json(item, depth + 1, found);
            }
        }
        _ => {}
    }
}

fn scan_yaml(value: &serde_yaml::Value, depth: usize, found: &mut BTreeSet<Protocol>) {
    if depth > SCAN_DEPTH {
        return;
    }
    match value {
        serde_yaml::Value::String(s) => scan_string_value(s, found),
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                scan_yaml(item, depth + 1, found);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map {
                scan_yaml(item, depth + 1, found);
            }
        }
        _ => {}
    }
}

fn decode_base64_text(content: &str) -> Option<String> {
    let stripped = strip_base64(content.trim())?;
    let bytes = STANDARD.decode(stripped).ok()?;
    String::from_utf8(bytes).ok()
}

/// Estimate how many configurations the payload holds.
pub fn estimate_config_count(content: &str) -> usize {
    if content.trim().is_empty() {
        return 0;
    }
    match detect_format(content) {
        PayloadFormat::Json => estimate_json(content),
        PayloadFormat::Yaml => content
            .lines()
            .filter(|line| line.trim_start().starts_with("- "))
            .count(),
        PayloadFormat::Base64 => match decode_base64_text(content) {
            Some(decoded) => estimate_config_count(&decoded),
            // Decoded to binary: estimate from separator density of the raw text.
            None => separator_estimate(content),
        },
        PayloadFormat::PlainText => Protocol::schemes()
            .map(|(_, scheme)| content.to_ascii_lowercase().matches(scheme).count())
            .sum(),
    }
}

fn estimate_json(content: &str) -> usize {
    match serde_json::from_str::<serde_json::Value>(content.trim()) {
        Ok(serde_json::Value::Array(items)) => items.len(),
        Ok(serde_json::Value::Object(map)) => CONFIG_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_array()).map(Vec::len))
            .unwrap_or(1),
        _ => separator_estimate(content),
    }
}

fn separator_estimate(content: &str) -> usize {
    let max_separators = ['\n', '|', ';', ',']
        .iter()
        .map(|sep| content.matches(*sep).count())
        .max()
        .unwrap_or(0);
    1.max(max_separators / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_uri_list_is_plain_text() {
        let body = "vmess://abc\nvless://def\n";
        assert_eq!(detect_format(body), PayloadFormat::PlainText);
        assert_eq!(estimate_config_count(body), 2);
        let protocols = detect_protocols(body);
        assert!(protocols.contains(&Protocol::Vmess));
        assert!(protocols.contains(&Protocol::Vless));
        assert_eq!(protocols.len(), 2);
    }

    #[test]
    fn json_object_counts_first_config_array() {
        let body = r#"{"proxies": [{"a":1},{"a":2},{"a":3}], "name": "x"}"#;
        assert_eq!(detect_format(body), PayloadFormat::Json);
        assert_eq!(estimate_config_count(body), 3);
    }

    #[test]
    fn json_array_counts_length() {
        let body = r#"[1, 2, 3, 4]"#;
        assert_eq!(estimate_config_count(body), 4);
    }

    #[test]
    fn json_object_without_config_keys_counts_one() {
        let body = r#"{"meta": "nothing here"}"#;
        assert_eq!(estimate_config_count(body), 1);
    }

    #[test]
    fn json_embedded_uris_are_detected() {
        let body = r#"{"outbounds": [{"uri": "trojan://secret@host:443"}]}"#;
        let protocols = detect_protocols(body);
        assert!(protocols.contains(&Protocol::Trojan));
    }

    #[test]
    fn yaml_counts_list_items() {
        let body = "proxies:\n  - name: a\n  - name: b\n";
        assert_eq!(detect_format(body), PayloadFormat::Yaml);
        assert_eq!(estimate_config_count(body), 2);
    }

    #[test]
    fn yaml_embedded_uri_is_detected() {
        let body = "proxies:\n  - uri: vless://id@host:443\n";
        assert!(detect_protocols(body).contains(&Protocol::Vless));
    }

    #[test]
    fn base64_payload_is_scanned_decoded() {
        let inner = "vmess://abc\nss://def\n";
        let body = STANDARD.encode(inner);
        assert_eq!(detect_format(&body), PayloadFormat::Base64);
        assert_eq!(estimate_config_count(&body), 2);
        let protocols = detect_protocols(&body);
        assert!(protocols.contains(&Protocol::Vmess));
        assert!(protocols.contains(&Protocol::Shadowsocks));
    }

    #[test]
    fn empty_body_estimates_zero() {
        assert_eq!(estimate_config_count(""), 0);
        assert_eq!(estimate_config_count("  \n \n"), 0);
    }

    #[test]
    fn prose_without_schemes_estimates_zero() {
        assert_eq!(estimate_config_count("hello world"), 0);
        assert!(detect_protocols("hello world").is_empty());
    }

    #[test]
    fn permissive_decode_fixes_missing_padding() {
        // "dGVzdDp0ZXN0" is "test:test" without padding.
        let decoded = decode_base64_permissive("dGVzdDp0ZXN0").expect("decodes");
        assert_eq!(decoded, b"test:test");
        assert!(decode_base64_permissive("!!!not base64!!!").is_none());
    }

    #[test]
    fn scan_depth_is_bounded() {
        // 12 levels of nesting around a URI: deeper than the scan limit.
        let mut body = String::from("\"vmess://deep\"");
        for _ in 0..12 {
            body = format!("{{\"k\": {body}}}");
        }
        assert!(detect_protocols(&body).is_empty());
    }
}
