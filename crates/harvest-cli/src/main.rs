use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use harvest_sync::{status_report, HarvestConfig, RunSummary, SyncPipeline};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Harvest GitHub Actions workflows into question/answer datasets")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute one harvest run (default).
    Run(RunArgs),
    /// Print shard and ledger counts for the dataset directory.
    Status(StatusArgs),
    /// Run on the configured cron schedule until interrupted.
    Schedule,
}

#[derive(Debug, Args, Default)]
struct RunArgs {
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct StatusArgs {
    /// Dataset directory; defaults to DATASET_DIR.
    #[arg(long)]
    dir: Option<PathBuf>,
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

fn level_for(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::WARN;
    }
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn print_summary(summary: &RunSummary, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!(
        "harvest complete: run_id={} records={} ledgered={} ledger_saved={} calls={}/{} stop={:?}",
        summary.run_id,
        summary.records_written,
        summary.identities_ledgered,
        summary.ledger_persisted,
        summary.calls_used,
        summary.calls_ceiling,
        summary.stop_reason
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(level_for(cli.verbose, cli.quiet));

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let summary = harvest_sync::run_sync_once_from_env().await?;
            print_summary(&summary, args.json)?;
            if !summary.ledger_persisted {
                bail!("ledger was not written; harvested identities will be retried next run");
            }
        }
        Commands::Status(args) => {
            let config = HarvestConfig::from_env();
            let dir = args.dir.unwrap_or(config.dataset_dir);
            let status = status_report(dir, config.shard_capacity).await?;
            println!("{}", status.to_markdown());
        }
        Commands::Schedule => {
            let mut config = HarvestConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            info!(
                cron = %pipeline.config().schedule_cron,
                dataset_dir = %pipeline.config().dataset_dir.display(),
                "starting scheduler; press Ctrl-C to stop"
            );
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default_command() {
        let cli = Cli::parse_from(["harvest-cli"]);
        assert!(cli.command.is_none());
        assert_eq!(level_for(cli.verbose, cli.quiet), LevelFilter::INFO);
    }

    #[test]
    fn verbosity_flags_map_to_levels() {
        let cli = Cli::parse_from(["harvest-cli", "-vv", "run", "--json"]);
        assert_eq!(level_for(cli.verbose, cli.quiet), LevelFilter::TRACE);
        assert!(matches!(cli.command, Some(Commands::Run(RunArgs { json: true }))));

        let cli = Cli::parse_from(["harvest-cli", "--quiet", "status", "--dir", "out"]);
        assert_eq!(level_for(cli.verbose, cli.quiet), LevelFilter::WARN);
        match cli.command {
            Some(Commands::Status(args)) => assert_eq!(args.dir, Some(PathBuf::from("out"))),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
