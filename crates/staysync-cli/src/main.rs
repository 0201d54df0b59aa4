use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use staysync_sync::{SyncConfig, SyncPipeline};
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "staysync-cli")]
#[command(about = "Reconcile Streamline reservations into a Notion database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Sync {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the source's room-type group table.
    Groups,
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let summary = staysync_sync::run_sync_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} fetched={} created={} updated={} skipped={} skipped_windows={}",
                    summary.run_id,
                    summary.fetched,
                    summary.created,
                    summary.updated,
                    summary.skipped,
                    summary.skipped_windows.len()
                );
            }
            if let Some(reason) = &summary.aborted {
                warn!(%reason, "pass ended early; rerun to pick up the remaining windows");
            }
        }
        Commands::Groups => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env()?)?;
            let table = pipeline
                .source()
                .list_groups()
                .await
                .context("listing room type groups")?;
            for (id, name) in table.iter() {
                println!("{id}\t{name}");
            }
            println!("{} groups", table.len());
        }
    }

    Ok(())
}
