//! clipblast
//!
//! Discovers media renderers on the local subnet and blasts a served
//! audio clip at them over UPnP AVTransport.

use clipblast::{bus, config};

use anyhow::Result;
use clipblast::orchestrator::{BlastOrchestrator, ConfiguredMediaSource};
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clipblast=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting clipblast v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = config::load_config()?;
    tracing::info!(
        "Configuration loaded: discovery timeout {}ms, concurrency {}",
        config.discovery.timeout_ms,
        config.control.concurrency
    );

    // Create event bus
    let bus = bus::create_bus();

    let media = Arc::new(ConfiguredMediaSource::new(config.media_url.clone()));
    let orchestrator = Arc::new(BlastOrchestrator::new(bus.clone(), &config, media));

    let command = std::env::args().nth(1).unwrap_or_else(|| "blast".to_string());
    match command.as_str() {
        "discover" => {
            let devices = tokio::select! {
                result = orchestrator.run_discover_only() => result?,
                _ = shutdown_signal() => {
                    orchestrator.stop().await;
                    return Ok(());
                }
            };
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        "blast" => {
            let summary = tokio::select! {
                result = orchestrator.run_blast() => result?,
                _ = shutdown_signal() => {
                    orchestrator.stop().await;
                    return Ok(());
                }
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        other => anyhow::bail!("unknown command: {} (expected blast|discover)", other),
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
