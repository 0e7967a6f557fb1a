use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use djcat_reconcile::{
    history_markdown, ApplyOptions, GroupWriteMode, ReconcileConfig, ReconcilePipeline, RunOutcome,
};
use djcat_reference::ReferenceTables;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "djcat-cli")]
#[command(about = "Check and repair DJ catalog groups and tiers against the reference tables")]
struct Cli {
    /// Record store backend: memory, postgres or rest.
    #[arg(long, global = true)]
    store: Option<String>,
    /// Directory holding groups.yaml, classifications.yaml and corrections.yaml.
    #[arg(long, global = true)]
    reference_dir: Option<PathBuf>,
    /// JSON snapshot used by the memory backend.
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
    /// Skip writing reports/<run_id>/.
    #[arg(long, global = true)]
    no_report: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Report group and tier drift without writing.
    Verify {
        /// Also treat names as equal when one contains the other.
        #[arg(long)]
        substring_match: bool,
    },
    /// Apply the correction table, then re-verify.
    Fix {
        #[arg(long)]
        dry_run: bool,
        /// Add corrected groups instead of replacing the record's groups.
        #[arg(long)]
        merge_groups: bool,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Summarise recent runs from the reports directory.
    History {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Print the SHA-256 fingerprint of the active reference tables.
    Fingerprint,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "djcat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn config_from(cli: &Cli) -> Result<ReconcileConfig> {
    let mut config = ReconcileConfig::from_env()?;
    if let Some(store) = &cli.store {
        config.store = store.parse()?;
    }
    if let Some(dir) = &cli.reference_dir {
        config.reference_dir = Some(dir.clone());
    }
    if let Some(path) = &cli.snapshot {
        config.snapshot_path = path.clone();
    }
    if let Some(dir) = &cli.reports_dir {
        config.reports_dir = Some(dir.clone());
    }
    if cli.no_report {
        config.reports_dir = None;
    }
    Ok(config)
}

fn print_outcome(outcome: &RunOutcome) -> bool {
    println!("{}", outcome.report.render_text());
    if let Some(dir) = &outcome.report_dir {
        eprintln!("report written to {}", dir.display());
    }
    outcome.passed()
}

/// `Ok(true)` when the catalog passed, `Ok(false)` when it did not.
async fn run(cli: Cli) -> Result<bool> {
    let mut config = config_from(&cli)?;

    match cli.command.unwrap_or(Commands::Verify {
        substring_match: false,
    }) {
        Commands::Verify { substring_match } => {
            config.substring_match |= substring_match;
            let pipeline = ReconcilePipeline::from_config(config).await?;
            Ok(print_outcome(&pipeline.verify().await?))
        }
        Commands::Fix {
            dry_run,
            merge_groups,
            concurrency,
        } => {
            let options = ApplyOptions {
                group_mode: if merge_groups {
                    GroupWriteMode::Merge
                } else {
                    GroupWriteMode::Replace
                },
                dry_run,
                concurrency: concurrency.unwrap_or(config.write_concurrency),
            };
            let pipeline = ReconcilePipeline::from_config(config).await?;
            Ok(print_outcome(&pipeline.fix(options).await?))
        }
        Commands::History { runs } => {
            let dir = config
                .reports_dir
                .context("history needs a reports directory")?;
            println!("{}", history_markdown(runs, &dir)?);
            Ok(true)
        }
        Commands::Fingerprint => {
            let reference = ReferenceTables::load(config.reference_dir.as_deref())
                .context("loading reference tables")?;
            println!("{}", reference.fingerprint()?);
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}
