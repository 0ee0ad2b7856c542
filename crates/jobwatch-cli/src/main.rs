mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use jobwatch_sync::{run_sync_once_from_env, RankMode, RunOptions};

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Poll ATS job boards, filter matches and email a digest of new postings")]
struct Cli {
    /// Render the digest and log it instead of sending email
    #[arg(long)]
    dry_run: bool,

    /// Report every fetched job, skipping keyword filters
    #[arg(long)]
    no_filter: bool,

    /// Forget previously reported jobs before this run
    #[arg(long)]
    reset_history: bool,

    /// Ordering of the digest: location-tier, company or recency
    #[arg(long, default_value_t = RankMode::LocationTier)]
    rank: RankMode,

    /// Directory holding sources.yaml, rules/ and the history file
    #[arg(long, env = "JOBWATCH_WORKSPACE")]
    workspace: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    telemetry::init().context("initializing telemetry")?;
    let cli = Cli::parse();

    let options = RunOptions {
        dry_run: cli.dry_run,
        no_filter: cli.no_filter,
        reset_history: cli.reset_history,
        rank_mode: cli.rank,
    };
    let summary = run_sync_once_from_env(options, cli.workspace).await?;

    println!(
        "run complete: run_id={} sources={} fetched={} matched={} unique={} new={} delivered={} inserted={} removed={} pruned={} warnings={}",
        summary.run_id,
        summary.sources,
        summary.fetched,
        summary.matched,
        summary.unique,
        summary.new,
        summary.delivered,
        summary.inserted,
        summary.removed,
        summary.pruned,
        summary.warnings.len()
    );

    Ok(if summary.delivered {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
