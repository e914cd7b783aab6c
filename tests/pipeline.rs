//! End-to-end pipeline scenarios against a local mock HTTP server.

use httpmock::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use submerge::config::FetcherSettings;
use submerge::events::EventBus;
use submerge::jobs::{JobManager, JobStatus, JsonFileStore};
use submerge::merger::{Merger, MergerConfig};
use submerge::output::{OutputWriter, ReportInputs};
use submerge::processor::ConfigProcessor;
use submerge::protocol::Protocol;
use submerge::sources::SourceManager;
use submerge::time::InstantSleeper;
use submerge::validator::SourceValidator;
use submerge::Fetcher;

struct Pipeline {
    merger: Arc<Merger>,
    bus: Arc<EventBus>,
    jobs: Arc<JobManager>,
    tmp: tempfile::TempDir,
}

async fn pipeline(urls: Vec<String>) -> Pipeline {
    let tmp = tempfile::tempdir().expect("tempdir");
    let settings = FetcherSettings {
        retry_attempts: 0,
        timeout: Duration::from_secs(5),
        ..FetcherSettings::default()
    };
    let bus = Arc::new(EventBus::new());
    let merger = Arc::new(Merger::new(
        Arc::new(SourceManager::from_urls(urls)),
        Arc::new(Fetcher::new(settings).with_sleeper(InstantSleeper)),
        Arc::new(SourceValidator::new("submerge-tests")),
        Arc::new(ConfigProcessor::new()),
        bus.clone(),
        MergerConfig::default(),
    ));
    let jobs = Arc::new(
        JobManager::with_store(
            Box::new(JsonFileStore::new(tmp.path().join("jobs.json"))),
            Duration::from_secs(3600),
            Duration::from_secs(600),
        )
        .await,
    );
    Pipeline {
        merger,
        bus,
        jobs,
        tmp,
    }
}

#[tokio::test]
async fn happy_path_single_source() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/sub");
            then.status(200).body("vmess://A\nvless://B\n");
        })
        .await;

    let pipeline = pipeline(vec![server.url("/sub")]).await;
    let outcome = pipeline.merger.run_quick(1).await.expect("run succeeds");

    assert_eq!(outcome.configs.len(), 2);
    let protocols: HashSet<Protocol> = outcome.configs.iter().map(|c| c.protocol).collect();
    assert_eq!(
        protocols,
        [Protocol::Vmess, Protocol::Vless].into_iter().collect()
    );

    let vmess = outcome
        .configs
        .iter()
        .find(|c| c.protocol == Protocol::Vmess)
        .unwrap();
    let vless = outcome
        .configs
        .iter()
        .find(|c| c.protocol == Protocol::Vless)
        .unwrap();
    // Base scores 0.8 / 0.9 plus the len/1000 bonus ("vmess://A" is 9 chars).
    assert!((vmess.quality_score - 0.809).abs() < 1e-9);
    assert!((vless.quality_score - 0.909).abs() < 1e-9);

    // Raw artifact is the LF-joined accepted list.
    let mut uris: Vec<String> = outcome.configs.iter().map(|c| c.uri.clone()).collect();
    uris.sort();
    assert_eq!(uris, vec!["vless://B".to_string(), "vmess://A".to_string()]);

    let writer = OutputWriter::new(pipeline.tmp.path().join("out"));
    let report = ReportInputs {
        configs: &outcome.configs,
        processing_time: outcome.elapsed,
        sources_total: outcome.sources.len(),
        sources_accessible: outcome.accessible_sources(),
        sources_quarantined: 0,
        failed_sources: outcome.failed_sources(),
    };
    writer
        .write_formats(&outcome.configs, &report, None)
        .await
        .expect("artifacts written");
    let raw = std::fs::read_to_string(
        pipeline.tmp.path().join("out/vpn_subscription_raw.txt"),
    )
    .unwrap();
    let mut lines: Vec<&str> = raw.split('\n').collect();
    lines.sort();
    assert_eq!(lines, vec!["vless://B", "vmess://A"]);
    assert!(!raw.ends_with('\n'));
}

#[tokio::test]
async fn dedup_across_sources_keeps_one() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/s1");
            then.status(200).body("vmess://X\n");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/s2");
            then.status(200).body(" vmess://X \n");
        })
        .await;

    let pipeline = pipeline(vec![server.url("/s1"), server.url("/s2")]).await;
    let outcome = pipeline
        .merger
        .run_comprehensive(None)
        .await
        .expect("run succeeds");

    assert_eq!(outcome.configs.len(), 1);
    assert_eq!(outcome.configs[0].uri, "vmess://X");

    let csv = submerge::output::to_csv(&outcome.configs);
    let rows: Vec<&str> = csv.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(rows.len(), 2, "header plus exactly one row");
}

#[tokio::test]
async fn malformed_lines_are_silently_skipped() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/sub");
            then.status(200).body("vmess://\nvless://Y\n<script>\n");
        })
        .await;

    let pipeline = pipeline(vec![server.url("/sub")]).await;
    let outcome = pipeline.merger.run_quick(1).await.expect("run succeeds");

    assert_eq!(outcome.configs.len(), 1);
    assert_eq!(outcome.configs[0].uri, "vless://Y");
    assert_eq!(outcome.configs[0].protocol, Protocol::Vless);
}

#[tokio::test]
async fn rerun_with_same_sources_is_idempotent() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/sub");
            then.status(200).body("trojan://T1\ntuic://T2\n");
        })
        .await;

    let pipeline = pipeline(vec![server.url("/sub")]).await;
    let first = pipeline.merger.run_quick(1).await.unwrap();
    let second = pipeline.merger.run_quick(1).await.unwrap();

    let set =
        |o: &submerge::MergeOutcome| -> HashSet<String> {
            o.configs.iter().map(|c| c.uri.clone()).collect()
        };
    assert_eq!(set(&first), set(&second));
    assert_eq!(second.configs.len(), 2);
}

#[tokio::test]
async fn inaccessible_source_is_reported_not_fatal() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/ok");
            then.status(200).body("ss://Y29uZmln\n");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/dead");
            then.status(404);
        })
        .await;

    let pipeline = pipeline(vec![server.url("/dead"), server.url("/ok")]).await;
    let outcome = pipeline.merger.run_comprehensive(None).await.unwrap();

    assert_eq!(outcome.configs.len(), 1);
    assert_eq!(outcome.accessible_sources(), 1);
    let failed = outcome.failed_sources();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].0.ends_with("/dead"));
    assert!(failed[0].1.contains("404"));
}

#[tokio::test]
async fn run_publishes_lifecycle_events() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/sub");
            then.status(200).body("vmess://EVT\n");
        })
        .await;

    let pipeline = pipeline(vec![server.url("/sub")]).await;
    pipeline.merger.run_quick(1).await.unwrap();

    let history = pipeline.bus.history(None, 100);
    let kinds: Vec<&str> = history.iter().map(|e| e.event_type.as_str()).collect();
    assert!(kinds.contains(&"run_started"));
    assert!(kinds.contains(&"source_validated"));
    assert!(kinds.contains(&"fetch_progress"));
    assert!(kinds.contains(&"batch_complete"));
    assert!(kinds.contains(&"run_done"));

    let progress = history
        .iter()
        .find(|e| e.event_type == "fetch_progress")
        .unwrap();
    assert_eq!(progress.data["done"], 1);
    assert_eq!(progress.data["total"], 1);
    assert!(progress.run_id().is_some());
}

#[tokio::test]
async fn cancelled_job_finishes_as_cancelled_and_persists() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path_includes("/s");
            then.status(200).body("vmess://FROM-CANCELLED-RUN\n");
        })
        .await;

    let urls: Vec<String> = (0..100).map(|i| server.url(format!("/s{i}"))).collect();
    let pipeline = pipeline(urls.clone()).await;

    let job = pipeline.jobs.create(urls).await;
    assert!(pipeline.jobs.cancel(&job.id).await, "cancel accepted");

    pipeline
        .merger
        .run_job(pipeline.jobs.clone(), &job.id)
        .await;

    let job = pipeline.jobs.get(&job.id).expect("job still listed");
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.finished_at.is_some());
    assert!(job.progress < 1.0);

    let persisted =
        std::fs::read_to_string(pipeline.tmp.path().join("jobs.json")).expect("store written");
    assert!(persisted.contains("cancelled"));
    assert!(persisted.contains(&job.id));
}

#[tokio::test]
async fn quarantine_kicks_in_after_repeated_failures() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/flaky");
            then.status(500);
        })
        .await;

    let url = server.url("/flaky");
    let pipeline = pipeline(vec![url.clone()]).await;

    for _ in 0..5 {
        pipeline.merger.run_comprehensive(None).await.unwrap();
    }

    let history = pipeline.bus.history(Some("source_quarantined"), 10);
    assert_eq!(history.len(), 1, "quarantine event published once");

    // A quarantined source drops out of prioritization: the next run has
    // nothing to do.
    let result = pipeline.merger.run_comprehensive(None).await;
    assert!(result.is_err(), "no sources left once quarantined");
}
