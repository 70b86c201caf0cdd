//! Daemon entry for the element store core: `serve` runs the materializer
//! shards and the changeset sweeper, `materialize` runs the shards alone,
//! `sweep-changesets` performs a single sweep pass and exits.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use osm_internal::api::OsmCore;
use osm_internal::config::CoreConfig;
use osm_internal::internal::store::memory::MemStore;

#[derive(Parser)]
#[command(name = "osmd", about = "OpenStreetMap element store daemon")]
struct Cli {
    /// JSON config file; built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full core: materializer shards plus the changeset sweeper.
    Serve,
    /// Run the materializer shards only.
    Materialize,
    /// Run one changeset sweep pass and exit.
    SweepChangesets,
}

fn load_config(path: Option<&PathBuf>) -> Result<CoreConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(CoreConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let core = OsmCore::open(MemStore::new(), config).await?;
    let cancel = CancellationToken::new();

    match cli.command {
        Command::Serve => {
            let mut tasks = core.spawn_materializer(cancel.clone());
            tasks.push(core.spawn_sweeper(cancel.clone()));
            info!("serving; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            cancel.cancel();
            for task in tasks {
                let _ = task.await;
            }
        }
        Command::Materialize => {
            let tasks = core.spawn_materializer(cancel.clone());
            info!("materializing; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            cancel.cancel();
            for task in tasks {
                let _ = task.await;
            }
        }
        Command::SweepChangesets => {
            let closed = core.sweep_changesets().await?;
            info!(closed, "sweep finished");
        }
    }

    let status = core.status().await?;
    info!(
        watermark = status.watermark,
        staging_depth = status.staging_depth,
        "shutdown complete"
    );
    Ok(())
}
