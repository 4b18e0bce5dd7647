use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use taskfabric::config::{MasterConfig, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "taskfabric")]
#[command(about = "Distributed job-execution fabric with storage as the source of truth")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker daemon
    Worker {
        /// Path to the worker TOML configuration
        #[arg(long)]
        config: PathBuf,

        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,

        /// Create the job table and its polling index before serving
        #[arg(long)]
        init_schema: bool,
    },
    /// Run the master daemon
    Master {
        /// Path to the master TOML configuration; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Worker {
            config,
            port,
            init_schema,
        } => {
            let mut config = WorkerConfig::load(config)?;
            if let Some(port) = port {
                config.port = port;
            }
            tracing::info!(host = %config.host, port = config.port, "starting worker");
            taskfabric::worker::run(config, init_schema).await?;
        }
        Command::Master { config, port } => {
            let mut config = match config {
                Some(path) => MasterConfig::load(path)?,
                None => MasterConfig::default(),
            };
            if let Some(port) = port {
                config.port = port;
            }
            tracing::info!(host = %config.host, port = config.port, "starting master");
            taskfabric::master::run(config).await?;
        }
    }
    Ok(())
}
