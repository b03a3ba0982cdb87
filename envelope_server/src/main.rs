// src/main.rs
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use envelope_core::{AcknowledgeHandler, KeyStore, SecureServer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_logging(settings: &config::Settings) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env()
        .add_directive("envelope_server=info".parse()?)
        .add_directive("envelope_core=info".parse()?)
        .add_directive("tokio=warn".parse()?);

    let console = fmt::layer().compact();

    match &settings.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "envelope_server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // -------- config + logging ----------
    let settings = config::Cli::parse_and_build_config()?;
    let _log_guard = init_logging(&settings)?;
    info!(addr = %settings.server_config().bind_addr, keep_alive = settings.keep_alive, "envelope server starting");

    // -------- keys ----------
    let keys = KeyStore::load(&settings.key_paths()).context("loading server keys")?;
    info!(public_key = %keys.public_key_base64()?, "give this public key to clients");

    // -------- listener ----------
    let server = SecureServer::bind(&settings.server_config(), Arc::new(keys), Arc::new(AcknowledgeHandler))
        .await
        .context("binding listener")?;

    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.serve(shutdown.clone()));
    info!("server running. Press Ctrl+C to stop");

    // -------- graceful shutdown ----------
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
    shutdown.cancel();
    // returns after in-flight exchanges drain or the grace period ends
    serving.await.context("server task panicked")?;
    Ok(())
}
