use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ledgersync::config::{default_config_path, Config};
use ledgersync::dedupe::DuplicateAuditor;
use ledgersync::storage::JsonFileStorage;

#[derive(Parser)]
#[command(name = "ledgersync")]
#[command(about = "Bank data reconciliation engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Find duplicate accounts for a user and optionally merge them
    Audit {
        user_id: String,
        /// Execute the merge plan. Without this flag the plan is only printed.
        #[arg(long)]
        apply: bool,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = Config::load_or_default(&config_path)?;
    let config_dir = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let data_dir = config.resolve_data_dir(&config_dir);

    match cli.command {
        Command::Audit { user_id, apply } => {
            let storage = Arc::new(JsonFileStorage::new(&data_dir));
            let auditor = DuplicateAuditor::new(storage);
            let plan = auditor.run(&user_id, !apply).await?;

            if apply {
                println!("Merged {} duplicate group(s)", plan.groups.len());
            } else {
                println!(
                    "Dry run: {} duplicate group(s) found. Re-run with --apply to merge.",
                    plan.groups.len()
                );
            }
            for group in &plan.groups {
                println!(
                    "  [{}] keep {} remove {:?} ({} transactions affected)",
                    group.matched_on,
                    group.survivor_id,
                    group
                        .removed_ids
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>(),
                    group.repointed_transactions
                );
            }
            for failure in &plan.failures {
                eprintln!("  FAILED group at {}: {}", failure.survivor_id, failure.detail);
            }
        }
        Command::Config => {
            println!("Config file: {}", config_path.display());
            println!("Data directory: {}", data_dir.display());
            println!("Worker limit: {}", config.sync.worker_limit);
            println!("Retry attempts: {}", config.sync.retry.max_attempts);
        }
    }

    Ok(())
}
