//! sweeper - delete-queue worker and publisher.

mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sweeper_core::impls::{AmqpConnector, ObjectStoreDeleter};
use sweeper_core::{DeleteWorker, ObjectId};

use crate::config::Configuration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (default: ./sweeper.toml)
    #[arg(short, long, global = true, env = "SWEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level regardless of configuration
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume delete requests until SIGINT/SIGTERM
    Worker,

    /// Publish delete requests
    Publish {
        /// Treat arguments as delivery URLs and extract the object id
        #[arg(long)]
        from_url: bool,

        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Print the effective configuration
    Config {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config =
        Configuration::load(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init(&config.log.filter, cli.verbose);

    match cli.command {
        Command::Worker => run_worker(&config).await,
        Command::Publish { from_url, ids } => publish(&config, from_url, &ids).await,
        Command::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("{config:#?}");
            }
            Ok(())
        }
    }
}

async fn run_worker(config: &Configuration) -> Result<()> {
    let storage_url = config.storage_url()?;
    let deleter = ObjectStoreDeleter::from_url(&storage_url)
        .with_context(|| format!("failed to open object store {storage_url}"))?;

    let client = config
        .client_builder()
        .connect(Arc::new(AmqpConnector::new()))
        .await
        .context("failed to connect to broker")?;

    let handle = DeleteWorker::new(client, Arc::new(deleter))
        .with_config(config.worker_config())
        .spawn();

    wait_for_shutdown_signal().await?;
    tracing::info!("shutting down, draining in-flight delete");
    handle.shutdown_and_join().await;
    Ok(())
}

async fn publish(config: &Configuration, from_url: bool, inputs: &[String]) -> Result<()> {
    let ids = inputs
        .iter()
        .map(|input| {
            let id = if from_url {
                ObjectId::from_asset_url(input)
            } else {
                ObjectId::new(input.as_str())
            };
            id.with_context(|| format!("invalid object id '{input}'"))
        })
        .collect::<Result<Vec<_>>>()?;

    let client = config
        .client_builder()
        .idle_timeout(None)
        .connect(Arc::new(AmqpConnector::new()))
        .await
        .context("failed to connect to broker")?;

    for id in &ids {
        client
            .publish_delete(id)
            .await
            .with_context(|| format!("failed to publish delete request for {id}"))?;
        println!("{id}");
    }
    client.close().await;
    Ok(())
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("received Ctrl+C");
    }

    Ok(())
}
