//! Hashkitty CLI - relay server and execution agent.
//!
//! This is the binary entry point. See the `hashkitty` library for the
//! core functionality.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hashkitty::{agent, Config, Hub, RelayServer};

// CLI
#[derive(Parser)]
#[command(name = "hashkitty")]
#[command(version)]
#[command(about = "Room-scoped WebSocket relay pairing controllers with hashcat agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server until interrupted
    Relay {
        /// Listen address (overrides the configured bind_addr)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run the execution agent until the connection ends
    Agent {
        /// Relay URL (overrides the configured relay_url)
        #[arg(long)]
        relay: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Commands::Relay { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            run_relay(&config)
        }
        Commands::Agent { relay } => {
            if let Some(relay) = relay {
                config.relay_url = relay;
            }
            run_agent(&config)
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Run the relay until Ctrl-C, then drain connections within the
/// configured grace period.
fn run_relay(config: &Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (hub, hub_task) = Hub::spawn();
        let server = RelayServer::bind(config, hub).await?;
        log::info!("[Relay] ready on {}", server.local_addr());

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        log::info!("[Relay] shutdown signal received");

        server
            .shutdown(Duration::from_secs(config.shutdown_grace_secs))
            .await;
        hub_task.await.context("hub task panicked")?;
        Ok(())
    })
}

/// Run the agent until its connection ends or Ctrl-C.
fn run_agent(config: &Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        tokio::select! {
            result = agent::run(config) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("[Agent] interrupted");
                Ok(())
            }
        }
    })
}
