//! taskgridd — the TaskGrid daemon.
//!
//! # Usage
//!
//! ```text
//! taskgridd standalone --config taskgrid.toml --data-dir /var/lib/taskgrid
//! taskgridd config > taskgrid.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskgrid_core::GridConfig;
use taskgridd::Node;

#[derive(Parser)]
#[command(name = "taskgridd", about = "TaskGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, recovery sweep and a local worker in one process.
    Standalone {
        /// Path to taskgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/taskgrid")]
        data_dir: PathBuf,

        /// Override `scheduler.backend`.
        #[arg(long)]
        backend: Option<String>,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Print the default configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            data_dir,
            backend,
            log_json,
        } => {
            init_tracing(log_json);
            run_standalone(config, data_dir, backend).await
        }
        Command::Config => {
            print!("{}", GridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,taskgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_standalone(
    config_path: Option<PathBuf>,
    data_dir: PathBuf,
    backend: Option<String>,
) -> anyhow::Result<()> {
    info!("TaskGrid daemon starting in standalone mode");

    let mut config = match &config_path {
        Some(path) => {
            let config = GridConfig::from_file(path)?;
            info!(path = ?path, "configuration loaded");
            config
        }
        None => GridConfig::default(),
    };
    if let Some(backend) = backend {
        config.scheduler.backend = backend;
    }

    let node = Node::open(config, &data_dir)?;

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                shutdown_tx.send_replace(true);
            }
            Err(e) => {
                error!(error = %e, "failed to install CTRL+C handler");
                // Dropping the sender would read as a shutdown.
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    node.run(shutdown_rx).await?;
    info!("TaskGrid daemon stopped");
    Ok(())
}
