use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use footfall_core::{format_day, parse_day};
use footfall_sync::{
    build_scheduler, migrate, report_history, run_sync_once, state_path_from_env,
    DateOverrides, SyncConfig,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "footfall-cli")]
#[command(about = "Sync hourly traffic-counter records into Postgres")]
struct Cli {
    /// First day to request (YYYY-MM-DD). Defaults to the previous run's end day.
    #[arg(long, global = true, value_parser = parse_date_arg)]
    from: Option<NaiveDate>,

    /// Last day to request (YYYY-MM-DD). Defaults to yesterday.
    #[arg(long, global = true, value_parser = parse_date_arg)]
    to: Option<NaiveDate>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Sync,
    Migrate,
    Schedule,
    History {
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },
}

fn parse_date_arg(raw: &str) -> Result<NaiveDate, String> {
    parse_day(raw).map_err(|err| format!("expected YYYY-MM-DD: {err}"))
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

/// Whole cause chain on one line, e.g. `loading configuration: missing ...`.
fn failure_message(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_logging();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %failure_message(&err), "footfall-cli failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let overrides = DateOverrides {
        from: cli.from,
        to: cli.to,
    };

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            let summary = run_sync_once(&config, overrides).await?;
            println!(
                "sync complete: run_id={} range={}..{} fetched={} affected={} token_reused={} reauthenticated={}",
                summary.run_id,
                format_day(summary.from_date),
                format_day(summary.to_date),
                summary.fetched_records,
                summary.rows_affected,
                summary.token_reused,
                summary.reauthenticated
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            migrate(&config).await.context("applying traffic_counts schema")?;
            println!("schema ready: traffic_counts");
        }
        Commands::Schedule => {
            if overrides != DateOverrides::default() {
                warn!("--from/--to are ignored by scheduled runs");
            }
            let config = Arc::new(SyncConfig::from_env().context("loading configuration")?);
            let mut sched = build_scheduler(Arc::clone(&config)).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::History { runs } => {
            let text = report_history(state_path_from_env(), runs).await?;
            println!("{text}");
        }
    }

    Ok(())
}
