use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use submerge::api;
use submerge::config::Settings;
use submerge::output::{Format, OutputWriter, ReportInputs};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "submerge", version, about = "VPN subscription aggregator")]
struct Cli {
    /// Path to the tiered sources config file.
    #[arg(long, global = true)]
    sources: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the REST/SSE/WebSocket boundary.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
    /// Run one merge and write artifacts.
    Merge {
        /// Space/comma-separated formats (raw, base64, csv, singbox, clash, report).
        #[arg(long)]
        formats: Option<String>,
        /// Only process the first N prioritized sources.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Validate source URLs and print their reliability scores.
    Validate {
        urls: Vec<String>,
        #[arg(long, default_value_t = 0.0)]
        min_score: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    let state = api::build_state(settings, cli.sources).await;

    match cli.command {
        Command::Serve { addr } => {
            let jobs = state.jobs.clone();
            tokio::spawn(jobs.run_cleanup_loop());
            api::serve(state, addr).await?;
        }
        Command::Merge { formats, limit } => {
            let outcome = match limit {
                Some(limit) => state.merger.run_quick(limit).await,
                None => state.merger.run_comprehensive(None).await,
            }
            .context("merge run failed")?;

            let wanted: Option<HashSet<Format>> = formats.map(|raw| {
                raw.replace(',', " ")
                    .split_whitespace()
                    .filter_map(|name| name.parse().ok())
                    .collect()
            });
            let report = ReportInputs {
                configs: &outcome.configs,
                processing_time: outcome.elapsed,
                sources_total: outcome.sources.len(),
                sources_accessible: outcome.accessible_sources(),
                sources_quarantined: state.sources.quarantined_count(),
                failed_sources: outcome.failed_sources(),
            };
            let writer = OutputWriter::new(state.settings.output_dir.clone());
            let written = writer
                .write_formats(&outcome.configs, &report, wanted.as_ref())
                .await
                .context("artifact write failed")?;
            for path in written {
                println!("{}", path.display());
            }
            println!(
                "{} configurations from {}/{} sources in {:.1}s",
                outcome.configs.len(),
                outcome.accessible_sources(),
                outcome.sources.len(),
                outcome.elapsed.as_secs_f64()
            );
        }
        Command::Validate { urls, min_score } => {
            let results = state.merger.validate_sources(&urls, min_score).await;
            for (url, score) in results {
                println!("{score:.3}\t{url}");
            }
        }
    }

    Ok(())
}
