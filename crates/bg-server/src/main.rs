//! Baguette server daemon
//!
//! Listens for node agents and applies a topology, either from a JSON file
//! or an empty one served by the default coordinator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bg_core::config::{self, ServerConfig};
use bg_server::{BaguetteServer, BrokerEndpoint, ServerEvent, TranslationContext};

#[derive(Parser)]
#[command(name = "baguette-server")]
#[command(about = "Baguette server - node agent control plane")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "BAGUETTE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Topology to apply at startup (JSON)
    #[arg(short, long)]
    topology: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Topology file layout
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TopologyFile {
    translation_context: TranslationContext,
    constants: BTreeMap<String, f64>,
    upperware_grouping: String,
    broker: BrokerEndpoint,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Baguette server starting...");

    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ServerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ServerConfig::default()
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    let topology = match &args.topology {
        Some(path) => load_topology(path)?,
        None => TopologyFile::default(),
    };

    let server = BaguetteServer::builder(config).build()?;
    let mut events = server.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!("Event log skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    server
        .set_topology_configuration(
            topology.translation_context,
            topology.constants,
            &topology.upperware_grouping,
            topology.broker,
        )
        .await
        .context("Failed to apply topology")?;

    if let (Some(addr), Some(fingerprint)) = (server.local_addr(), server.host_key_fingerprint()) {
        tracing::info!("Accepting agents on {} (host key {})", addr, fingerprint);
    }

    shutdown_signal().await;

    server.stop_server().await;
    tracing::info!("Baguette server shutdown complete");
    Ok(())
}

fn load_topology(path: &Path) -> Result<TopologyFile> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read topology from {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse topology {:?}", path))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = ctrl_c => {
            if let Err(e) = result {
                tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            }
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientRegistered { .. } | ServerEvent::ClientExited { .. } => {
            tracing::info!("Event: {:?}", event)
        }
        ServerEvent::ClientException { .. } | ServerEvent::SelfHealingGiveUp { .. } => {
            tracing::warn!("Event: {:?}", event)
        }
        _ => tracing::debug!("Event: {:?}", event),
    }
}
