//! Crossover routing daemon

mod controller;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use controller::LoggingController;
use crossover_core::domain::{ConfigManager, DaemonConfig, Router, SinkId, SourceId};
use crossover_infra::{ControlHandle, Daemon};
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crossoverd")]
#[command(about = "Audio routing daemon for multi-domain vehicle audio", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon with simulated domains
    Run,
    /// Print the routes between a source and a sink
    Routes {
        #[arg(long)]
        source: u16,
        #[arg(long)]
        sink: u16,
        /// Skip gateways already carrying a connection
        #[arg(long)]
        only_free: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the factory default configuration
    DefaultConfig,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command.unwrap_or(Command::Run) {
        Command::DefaultConfig => {
            print!("{}", DaemonConfig::factory_default().to_toml()?);
            Ok(())
        }
        Command::Routes {
            source,
            sink,
            only_free,
            json,
        } => {
            let config = load_config(cli.config).await?;
            print_routes(&config, source, sink, only_free, json)
        }
        Command::Run => {
            let config = load_config(cli.config).await?;
            run(config).await
        }
    }
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<DaemonConfig> {
    let manager = match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(
            ConfigManager::default_config_dir().context("failed to resolve config directory")?,
        ),
    };
    info!(path = %manager.config_path().display(), "Loading configuration");
    Ok(manager.load().await)
}

fn print_routes(
    config: &DaemonConfig,
    source: u16,
    sink: u16,
    only_free: bool,
    json: bool,
) -> anyhow::Result<()> {
    let store = config
        .topology
        .build_store()
        .context("invalid topology")?;
    let routes = Router::new()
        .find_routes(&store, only_free, SourceId::new(source), SinkId::new(sink))
        .with_context(|| format!("no route from source {source} to sink {sink}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&routes)?);
        return Ok(());
    }
    for (rank, route) in routes.iter().enumerate() {
        let hops: Vec<String> = route
            .elements
            .iter()
            .map(|e| {
                format!(
                    "{} -> {} in domain {} as {:?}",
                    e.source_id, e.sink_id, e.domain_id, e.format
                )
            })
            .collect();
        println!("#{}: {}", rank + 1, hops.join(" | "));
    }
    Ok(())
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("Crossover starting");

    let (ready_tx, ready_rx) = oneshot::channel::<ControlHandle>();
    let daemon_config = config.clone();
    let mut daemon = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut daemon = Daemon::new(&daemon_config, Box::<LoggingController>::default())
            .context("failed to start daemon")?;
        let _ = ready_tx.send(daemon.control_handle());
        daemon.run().context("event loop failed")?;
        Ok(())
    });

    let control = match ready_rx.await {
        Ok(control) => control,
        Err(_) => {
            daemon.await.context("daemon thread panicked")??;
            bail!("daemon exited during startup");
        }
    };

    let startup = control.clone();
    let connections = config.startup.connections.clone();
    tokio::task::spawn_blocking(move || {
        for connection in connections {
            match startup.connect(connection.source, connection.sink) {
                Ok(main) => info!(%main, source = %connection.source, sink = %connection.sink, "Startup connection requested"),
                Err(e) => warn!(source = %connection.source, sink = %connection.sink, error = %e, "Startup connection rejected"),
            }
        }
    })
    .await
    .context("startup connections panicked")?;

    let interrupted = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            true
        }
        result = &mut daemon => {
            result.context("daemon thread panicked")??;
            false
        }
    };
    if interrupted {
        info!("Ctrl-C received, shutting down");
        control.shutdown()?;
        daemon.await.context("daemon thread panicked")??;
    }

    info!("Crossover stopped");
    Ok(())
}
