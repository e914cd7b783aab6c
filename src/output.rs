//! Subscription artifact rendering and the run-summaries log.
//!
//! Rendering is mechanical; the wire contracts are the interesting part:
//! raw is LF-joined, base64 is the unbroken standard encoding of raw, the
//! CSV is RFC 4180 with a `Config,Ping_MS` header, sing-box and Clash carry
//! one entry per accepted configuration.

use crate::processor::VpnConfiguration;
use crate::protocol::Protocol;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Raw,
    Base64,
    Csv,
    Singbox,
    Clash,
    Report,
}

impl Format {
    pub fn file_name(&self) -> &'static str {
        match self {
            Format::Raw => "vpn_subscription_raw.txt",
            Format::Base64 => "vpn_subscription_base64.txt",
            Format::Csv => "vpn_detailed.csv",
            Format::Singbox => "vpn_singbox.json",
            Format::Clash => "clash.yaml",
            Format::Report => "vpn_report.json",
        }
    }

    pub fn all() -> &'static [Format] {
        &[
            Format::Raw,
            Format::Base64,
            Format::Csv,
            Format::Singbox,
            Format::Clash,
            Format::Report,
        ]
    }
}

impl FromStr for Format {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Format::Raw),
            "base64" => Ok(Format::Base64),
            "csv" => Ok(Format::Csv),
            "singbox" => Ok(Format::Singbox),
            "clash" => Ok(Format::Clash),
            "report" => Ok(Format::Report),
            _ => Err(()),
        }
    }
}

/// LF-joined URI list, no trailing newline.
pub fn to_raw(uris: &[String]) -> String {
    uris.join("\n")
}

/// Standard base64 of the raw text, unbroken.
pub fn to_base64(uris: &[String]) -> String {
    STANDARD.encode(to_raw(uris))
}

/// `Config,Ping_MS` rows; ping blank when unknown.
pub fn to_csv(configs: &[VpnConfiguration]) -> String {
    let mut out = String::from("Config,Ping_MS\r\n");
    for config in configs {
        out.push_str(&csv_field(&config.uri));
        out.push(',');
        // Reachability testing is external; ping is blank until it reports.
        out.push_str("\r\n");
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// sing-box outbounds document.
pub fn to_singbox(configs: &[VpnConfiguration]) -> serde_json::Value {
    let outbounds: Vec<serde_json::Value> = configs
        .iter()
        .enumerate()
        .map(|(index, config)| {
            let mut outbound = serde_json::json!({
                "type": singbox_type(config.protocol),
                "tag": format!("proxy-{index}"),
                "raw_uri": config.uri,
            });
            if let Some(host) = &config.host {
                outbound["server"] = serde_json::json!(host);
            }
            if let Some(port) = config.port {
                outbound["server_port"] = serde_json::json!(port);
            }
            outbound
        })
        .collect();
    serde_json::json!({ "outbounds": outbounds })
}

fn singbox_type(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Vmess => "vmess",
        Protocol::Vless => "vless",
        Protocol::Trojan => "trojan",
        Protocol::Shadowsocks => "shadowsocks",
        Protocol::Shadowsocksr => "shadowsocksr",
        Protocol::Hysteria => "hysteria",
        Protocol::Hysteria2 => "hysteria2",
        Protocol::Tuic => "tuic",
        Protocol::Wireguard => "wireguard",
        Protocol::Unknown => "direct",
    }
}

/// Minimal Clash document: a `proxies` list with name/type/server/port.
pub fn to_clash(configs: &[VpnConfiguration]) -> String {
    #[derive(serde::Serialize)]
    struct ClashProxy<'a> {
        name: String,
        #[serde(rename = "type")]
        proxy_type: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        server: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    }
    #[derive(serde::Serialize)]
    struct ClashDocument<'a> {
        proxies: Vec<ClashProxy<'a>>,
    }

    let document = ClashDocument {
        proxies: configs
            .iter()
            .enumerate()
            .map(|(index, config)| ClashProxy {
                name: format!("{}-{index}", config.protocol),
                proxy_type: config.protocol.as_str(),
                server: config.host.as_deref(),
                port: config.port,
            })
            .collect(),
    };
    serde_yaml::to_string(&document).unwrap_or_else(|_| "proxies: []\n".to_string())
}

/// Inputs to the JSON report.
#[derive(Debug, Clone)]
pub struct ReportInputs<'a> {
    pub configs: &'a [VpnConfiguration],
    pub processing_time: std::time::Duration,
    pub sources_total: usize,
    pub sources_accessible: usize,
    pub sources_quarantined: usize,
    pub failed_sources: Vec<(String, String)>,
}

pub fn to_report(inputs: &ReportInputs<'_>) -> serde_json::Value {
    let reachable = inputs
        .configs
        .iter()
        .filter(|c| c.is_reachable == Some(true))
        .count();
    let protocols = crate::processor::ConfigProcessor::protocol_distribution(inputs.configs);
    serde_json::json!({
        "generation_info": {
            "timestamp_utc": chrono::Utc::now().to_rfc3339(),
            "processing_time_seconds": inputs.processing_time.as_secs_f64(),
        },
        "statistics": {
            "total_configs": inputs.configs.len(),
            "reachable_configs": reachable,
            "protocol_distribution": protocols,
        },
        "source_categories": {
            "total_unique_sources": inputs.sources_total,
            "accessible_sources": inputs.sources_accessible,
            "quarantined_sources": inputs.sources_quarantined,
            "failed_sources": inputs.failed_sources.iter().map(|(url, error)| {
                serde_json::json!({ "url": url, "accessible": false, "error": error })
            }).collect::<Vec<_>>(),
        },
    })
}

/// Writes artifacts under one directory. Writes go through a temp file and a
/// rename so readers never observe a half-written artifact.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    dir: PathBuf,
}

impl OutputWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write_formats(
        &self,
        configs: &[VpnConfiguration],
        report: &ReportInputs<'_>,
        formats: Option<&HashSet<Format>>,
    ) -> std::io::Result<Vec<PathBuf>> {
        let uris: Vec<String> = configs.iter().map(|c| c.uri.clone()).collect();
        let mut written = Vec::new();
        for format in Format::all() {
            if formats.is_some_and(|wanted| !wanted.contains(format)) {
                continue;
            }
            let text = match format {
                Format::Raw => to_raw(&uris),
                Format::Base64 => to_base64(&uris),
                Format::Csv => to_csv(configs),
                Format::Singbox => {
                    serde_json::to_string_pretty(&to_singbox(configs)).unwrap_or_default()
                }
                Format::Clash => to_clash(configs),
                Format::Report => {
                    serde_json::to_string_pretty(&to_report(report)).unwrap_or_default()
                }
            };
            written.push(self.write_atomic(format.file_name(), &text).await?);
        }
        Ok(written)
    }

    pub async fn write_atomic(&self, file_name: &str, text: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(file_name);
        let tmp = self.dir.join(format!("{file_name}.tmp"));
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }
}

/// Append-only log of run summaries, one JSON object per line.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Best-effort append; a failed write is logged and swallowed.
    pub async fn append(&self, summary: &serde_json::Value) {
        let write = async {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            use tokio::io::AsyncWriteExt;
            let mut line = summary.to_string();
            line.push('\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        };
        if let Err(err) = write.await {
            tracing::warn!(error = %err, "run log append failed");
        }
    }

    /// Last `n` summaries, oldest first.
    pub async fn tail(&self, n: usize) -> Vec<serde_json::Value> {
        let Ok(text) = tokio::fs::read_to_string(&self.path).await else {
            return Vec::new();
        };
        let summaries: Vec<serde_json::Value> = text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let skip = summaries.len().saturating_sub(n);
        summaries.into_iter().skip(skip).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ConfigProcessor;

    fn sample_configs() -> Vec<VpnConfiguration> {
        let processor = ConfigProcessor::new();
        [
            "vmess://alpha-payload",
            "vless://uuid@host.example:443#tag",
        ]
        .iter()
        .filter_map(|line| processor.process(line, Some("https://src.example/sub")))
        .collect()
    }

    #[test]
    fn raw_is_lf_joined_without_trailing_newline() {
        let uris = vec!["vmess://a".to_string(), "vless://b".to_string()];
        assert_eq!(to_raw(&uris), "vmess://a\nvless://b");
    }

    #[test]
    fn base64_is_unbroken_encoding_of_raw() {
        let uris = vec!["vmess://a".to_string(), "vless://b".to_string()];
        let encoded = to_base64(&uris);
        assert!(!encoded.contains('\n'));
        let decoded = STANDARD.decode(&encoded).expect("valid base64");
        assert_eq!(decoded, b"vmess://a\nvless://b");
    }

    #[test]
    fn csv_has_header_and_blank_ping() {
        let configs = sample_configs();
        let csv = to_csv(&configs);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("Config,Ping_MS"));
        assert_eq!(lines.next(), Some("vmess://alpha-payload,"));
    }

    #[test]
    fn csv_quotes_fields_with_commas_and_quotes() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn singbox_carries_type_and_endpoint() {
        let configs = sample_configs();
        let doc = to_singbox(&configs);
        let outbounds = doc["outbounds"].as_array().unwrap();
        assert_eq!(outbounds.len(), 2);
        assert_eq!(outbounds[0]["type"], "vmess");
        assert_eq!(outbounds[1]["type"], "vless");
        assert_eq!(outbounds[1]["server"], "host.example");
        assert_eq!(outbounds[1]["server_port"], 443);
    }

    #[test]
    fn clash_yaml_lists_proxies() {
        let configs = sample_configs();
        let yaml = to_clash(&configs);
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).expect("valid yaml");
        let proxies = parsed["proxies"].as_sequence().unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[1]["server"].as_str(), Some("host.example"));
    }

    #[test]
    fn report_counts_and_failures() {
        let configs = sample_configs();
        let inputs = ReportInputs {
            configs: &configs,
            processing_time: std::time::Duration::from_secs_f64(1.5),
            sources_total: 3,
            sources_accessible: 2,
            sources_quarantined: 1,
            failed_sources: vec![("https://dead.example/sub".into(), "HTTP 404".into())],
        };
        let report = to_report(&inputs);
        assert_eq!(report["statistics"]["total_configs"], 2);
        assert_eq!(report["statistics"]["reachable_configs"], 0);
        assert_eq!(report["source_categories"]["total_unique_sources"], 3);
        assert_eq!(report["source_categories"]["quarantined_sources"], 1);
        let failed = report["source_categories"]["failed_sources"]
            .as_array()
            .unwrap();
        assert_eq!(failed[0]["error"], "HTTP 404");
        assert_eq!(failed[0]["accessible"], false);
    }

    #[tokio::test]
    async fn writer_produces_requested_formats() {
        let dir = tempfile::tempdir().unwrap();
        let writer = OutputWriter::new(dir.path());
        let configs = sample_configs();
        let inputs = ReportInputs {
            configs: &configs,
            processing_time: std::time::Duration::from_secs(1),
            sources_total: 1,
            sources_accessible: 1,
            sources_quarantined: 0,
            failed_sources: Vec::new(),
        };
        let wanted: HashSet<Format> = [Format::Raw, Format::Base64].into_iter().collect();
        let written = writer
            .write_formats(&configs, &inputs, Some(&wanted))
            .await
            .unwrap();
        assert_eq!(written.len(), 2);

        let raw = tokio::fs::read_to_string(dir.path().join("vpn_subscription_raw.txt"))
            .await
            .unwrap();
        assert_eq!(raw, "vmess://alpha-payload\nvless://uuid@host.example:443#tag");
        assert!(!dir.path().join("vpn_singbox.json").exists());
    }

    #[tokio::test]
    async fn run_log_appends_and_tails() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("runs.log"));
        for i in 0..4 {
            log.append(&serde_json::json!({ "run": i })).await;
        }
        let tail = log.tail(2).await;
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0]["run"], 2);
        assert_eq!(tail[1]["run"], 3);
    }
}
