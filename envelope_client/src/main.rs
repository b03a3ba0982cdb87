// src/main.rs
mod config;
mod job;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envelope_core::{KeyStore, SecureClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Command;

#[tokio::main]
async fn main() -> Result<()> {
    // -------- logging ----------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("envelope_client=info".parse()?)
                .add_directive("envelope_core=info".parse()?)
                .add_directive("tokio=warn".parse()?),
        )
        .compact()
        .init();

    // -------- config + keys ----------
    let (command, settings) = config::Cli::parse_and_build_config()?;
    let keys = KeyStore::load(&settings.key_paths()).context("loading client keys")?;
    let client_config = settings.client_config();
    info!(
        server = %client_config.pool.address,
        pool_size = client_config.pool.size,
        single_use = client_config.pool.single_use,
        client_id = %settings.client_id,
        "envelope client starting"
    );
    let client = SecureClient::new(Arc::new(keys), client_config);

    match command {
        Command::Send { message } => {
            let reply = client.send(&message).await.context("exchange failed")?;
            println!("{reply}");
        }
        Command::Periodic { interval_secs, count } => {
            let shutdown = CancellationToken::new();
            let sender = job::spawn_periodic_sender(
                client.clone(),
                // tokio intervals must be non-zero
                Duration::from_secs(interval_secs.max(1)),
                settings.client_id.clone(),
                count,
                shutdown.clone(),
            );

            let watcher = {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(?e, "failed to install Ctrl+C handler");
                        return;
                    }
                    info!("shutdown signal received");
                    shutdown.cancel();
                })
            };

            let delivered = sender.await.context("periodic sender panicked")?;
            watcher.abort();
            client.pool().close();
            info!(delivered, "done");
        }
    }
    Ok(())
}
