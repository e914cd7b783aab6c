//! REST handlers under `/api/v1`.

use super::{check_token, tenant_from_request, tenant_output_dir, AppState, QueryMap};
use crate::output::{self, Format, OutputWriter, ReportInputs};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Response size cap when serving artifacts.
const MAX_ARTIFACT_BYTES: usize = 5_000_000;

type ApiError = (StatusCode, String);

fn gate(
    state: &AppState,
    addr: &SocketAddr,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), ApiError> {
    let tenant = tenant_from_request(&state.settings, headers, query);
    if !state
        .limiter
        .allow(&addr.ip().to_string(), tenant.as_deref())
    {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limit".into()));
    }
    check_token(&state.settings, headers, query)
        .map_err(|status| (status, "unauthorized".into()))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn ready(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ready = state.store.probe().await;
    Json(serde_json::json!({ "ready": ready }))
}

pub async fn limits(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Json<serde_json::Value> {
    let tenant = tenant_from_request(&state.settings, &headers, &query);
    let allowed = state
        .limiter
        .allow(&addr.ip().to_string(), tenant.as_deref());
    Json(serde_json::json!({
        "allowed": allowed,
        "window_s": super::BOUNDARY_WINDOW.as_secs_f64(),
        "max_requests": super::BOUNDARY_MAX_REQUESTS,
    }))
}

pub async fn run_merge(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&state, &addr, &headers, &query)?;

    let formats = query.get("formats").map(|raw| parse_formats(raw));
    let limit = query.get("limit").and_then(|v| v.parse::<usize>().ok());
    let dir = tenant_output_dir(&state.settings, &headers, &query);

    let formats_echo: Option<Vec<String>> = query.get("formats").map(|raw| {
        let mut names: Vec<String> = raw
            .replace(',', " ")
            .split_whitespace()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        names.sort();
        names
    });

    let background = state.clone();
    tokio::spawn(async move {
        execute_merge(background, dir, formats, limit).await;
    });

    Ok(Json(serde_json::json!({
        "started": true,
        "formats": formats_echo,
        "limit": limit,
    })))
}

/// Background body of `POST /run/merge`: run, then write artifacts.
async fn execute_merge(
    state: AppState,
    dir: PathBuf,
    formats: Option<HashSet<Format>>,
    limit: Option<usize>,
) {
    let outcome = match limit {
        Some(limit) => state.merger.run_quick(limit).await,
        None => state.merger.run_comprehensive(None).await,
    };
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(error = %err, "merge run failed");
            return;
        }
    };
    let report = ReportInputs {
        configs: &outcome.configs,
        processing_time: outcome.elapsed,
        sources_total: outcome.sources.len(),
        sources_accessible: outcome.accessible_sources(),
        sources_quarantined: state.sources.quarantined_count(),
        failed_sources: outcome.failed_sources(),
    };
    let writer = OutputWriter::new(dir);
    if let Err(err) = writer
        .write_formats(&outcome.configs, &report, formats.as_ref())
        .await
    {
        tracing::error!(error = %err, "artifact write failed");
    }
}

fn parse_formats(raw: &str) -> HashSet<Format> {
    raw.replace(',', " ")
        .split_whitespace()
        .filter_map(|name| name.parse().ok())
        .collect()
}

async fn serve_artifact(
    state: &AppState,
    addr: &SocketAddr,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    file_name: &str,
) -> Result<String, ApiError> {
    gate(state, addr, headers, query)?;
    let dir = tenant_output_dir(&state.settings, headers, query);
    let path = dir.join(file_name);
    let mut text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "not found".to_string()))?;
    if text.len() > MAX_ARTIFACT_BYTES {
        text.truncate(MAX_ARTIFACT_BYTES);
    }
    Ok(text)
}

pub async fn sub_raw(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Result<String, ApiError> {
    serve_artifact(&state, &addr, &headers, &query, Format::Raw.file_name()).await
}

pub async fn sub_base64(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Result<String, ApiError> {
    serve_artifact(&state, &addr, &headers, &query, Format::Base64.file_name()).await
}

pub async fn sub_singbox(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let text = serve_artifact(&state, &addr, &headers, &query, Format::Singbox.file_name()).await?;
    let value = serde_json::from_str(&text)
        .unwrap_or_else(|_| serde_json::json!({ "raw": text }));
    Ok(Json(value))
}

pub async fn sub_report(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let text = serve_artifact(&state, &addr, &headers, &query, Format::Report.file_name()).await?;
    let value = serde_json::from_str(&text)
        .unwrap_or_else(|_| serde_json::json!({ "raw": text }));
    Ok(Json(value))
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    urls: Vec<String>,
    min_score: Option<f64>,
}

pub async fn validate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
    Json(request): Json<ValidateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&state, &addr, &headers, &query)?;
    let min_score = request.min_score.unwrap_or(0.5);
    let results = state.merger.validate_sources(&request.urls, min_score).await;
    Ok(Json(serde_json::json!({ "results": results })))
}

#[derive(Deserialize)]
pub struct FormatRequest {
    #[serde(rename = "type", default)]
    format_type: Option<String>,
    #[serde(default)]
    lines: Vec<String>,
}

pub async fn format_configs(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
    Json(request): Json<FormatRequest>,
) -> Result<String, ApiError> {
    gate(&state, &addr, &headers, &query)?;
    let configs = parse_lines(&request.lines);
    let rendered = match request.format_type.as_deref().unwrap_or("raw") {
        "base64" => output::to_base64(&request.lines),
        "csv" => output::to_csv(&configs),
        "clash" => output::to_clash(&configs),
        "singbox" => serde_json::to_string_pretty(&output::to_singbox(&configs))
            .unwrap_or_default(),
        _ => output::to_raw(&request.lines),
    };
    Ok(rendered)
}

/// Parse raw lines through a throwaway processor so one-off formatting does
/// not pollute the run dedup state.
fn parse_lines(lines: &[String]) -> Vec<crate::processor::VpnConfiguration> {
    let processor = crate::processor::ConfigProcessor::new();
    lines
        .iter()
        .filter_map(|line| processor.process(line, None))
        .collect()
}

#[derive(Deserialize)]
pub struct FilterRequest {
    #[serde(default)]
    lines: Vec<String>,
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
}

pub async fn filter_configs(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
    Json(request): Json<FilterRequest>,
) -> Result<String, ApiError> {
    gate(&state, &addr, &headers, &query)?;
    let include: Option<HashSet<String>> = request
        .include
        .map(|list| list.into_iter().map(|p| p.to_ascii_lowercase()).collect());
    let exclude: HashSet<String> = request
        .exclude
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.to_ascii_lowercase())
        .collect();

    let kept: Vec<String> = request
        .lines
        .into_iter()
        .filter(|line| {
            let scheme = line
                .split("://")
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase();
            if let Some(include) = &include {
                if !include.contains(&scheme) {
                    return false;
                }
            }
            !exclude.contains(&scheme)
        })
        .collect();
    Ok(kept.join("\n"))
}

#[derive(Deserialize)]
pub struct ScoreRequest {
    #[serde(default)]
    lines: Vec<String>,
    top: Option<usize>,
}

pub async fn score_configs(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
    Json(request): Json<ScoreRequest>,
) -> Result<String, ApiError> {
    gate(&state, &addr, &headers, &query)?;
    let mut sorted = state.merger.score_and_sort(&request.lines);
    let top = request.top.unwrap_or(100);
    if top > 0 {
        sorted.truncate(top);
    }
    Ok(sorted.join("\n"))
}

#[derive(Deserialize)]
pub struct ExportRequest {
    #[serde(default)]
    formats: Vec<String>,
    #[serde(default)]
    lines: Vec<String>,
    output_dir: Option<String>,
}

pub async fn export(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
    Json(request): Json<ExportRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&state, &addr, &headers, &query)?;

    let base = tenant_output_dir(&state.settings, &headers, &query);
    let dir = secure_subdir(&base, request.output_dir.as_deref())
        .ok_or((StatusCode::BAD_REQUEST, "invalid output_dir".to_string()))?;

    let configs = parse_lines(&request.lines);
    let wanted: HashSet<Format> = request
        .formats
        .iter()
        .filter_map(|name| name.parse().ok())
        .collect();
    let report = ReportInputs {
        configs: &configs,
        processing_time: std::time::Duration::ZERO,
        sources_total: 0,
        sources_accessible: 0,
        sources_quarantined: state.sources.quarantined_count(),
        failed_sources: Vec::new(),
    };
    let writer = OutputWriter::new(dir);
    let written = writer
        .write_formats(&configs, &report, Some(&wanted))
        .await
        .map_err(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("write failed: {err}"),
            )
        })?;
    let written: Vec<String> = written
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    Ok(Json(serde_json::json!({ "written": written })))
}

/// Join a caller-supplied subdirectory under the base, refusing absolute
/// paths and parent traversal.
fn secure_subdir(base: &std::path::Path, sub: Option<&str>) -> Option<PathBuf> {
    match sub {
        None | Some("") | Some(".") => Some(base.to_path_buf()),
        Some(sub) => {
            let candidate = std::path::Path::new(sub);
            if candidate.is_absolute()
                || candidate
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return None;
            }
            Some(base.join(candidate))
        }
    }
}

pub async fn discover(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&state, &addr, &headers, &query)?;
    let limit = query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(100);
    let mut urls = state.discovery.discover().await;
    urls.truncate(limit);
    // Discovered sources join the custom tier for subsequent runs.
    state.sources.add_custom(&urls);
    Ok(Json(serde_json::json!({ "count": urls.len(), "urls": urls })))
}

pub async fn stats(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&state, &addr, &headers, &query)?;
    let stats = serde_json::json!({
        "fetcher": state.fetcher.statistics(),
        "sources": state.sources.statistics(),
        "validator": state.validator.statistics(),
        "events": state.bus.metrics(),
        "discovery": state.discovery.statistics(),
        "jobs": {
            "count": state.jobs.list().len(),
            "save_errors": state.jobs.save_errors(),
            "metrics": state.jobs.metrics(),
        },
    });
    Ok(Json(stats))
}

pub async fn runs(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&state, &addr, &headers, &query)?;
    let limit = query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(50);
    let runs = state.run_log.tail(limit).await;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

pub async fn events(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::extract::Query(query): QueryMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    gate(&state, &addr, &headers, &query)?;
    let limit = query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(100);
    let events = state.store.tail(limit).await;
    Ok(Json(serde_json::json!({ "events": events })))
}
