//! chatrelay-gateway: public side of the chat relay.
//!
//! Receives platform webhooks, verifies and decrypts them, and forwards them
//! over a persistent WebSocket to the single connected agent client. While
//! no client is connected, users get a fallback reply instead.

mod api;
mod config;
mod dedup;
mod fallback;
mod rate_limit;
mod registry;
mod server;
mod webhook;

use anyhow::Context;
use chatrelay_platform::WeComApi;
use clap::Parser;
use config::{GatewayConfig, Overrides, RelayMode};
use server::Gateway;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bound on the HTTP drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// chatrelay-gateway: webhook gateway for chatrelay
#[derive(Parser, Debug)]
#[command(name = "chatrelay-gateway", version, about = "Webhook gateway for chatrelay")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.chatrelay/gateway.toml")]
    config: String,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Forward decrypted messages or raw envelopes
    #[arg(long, value_enum)]
    relay_mode: Option<RelayMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let overrides = Overrides {
        bind: cli.bind,
        port: cli.port,
        relay_mode: cli.relay_mode,
    };
    let config = GatewayConfig::load(&PathBuf::from(&cli.config), &overrides)
        .context("failed to load config")?;

    let platform = WeComApi::new(config.wecom.api_config()).context("invalid [wecom] credentials")?;
    let addr = format!("{}:{}", config.bind, config.port);
    let relay_mode = config.relay_mode;
    let gateway = Gateway::new(config, Arc::new(platform)).context("failed to create gateway")?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        relay_mode = %relay_mode,
        "starting chatrelay-gateway"
    );

    let mut server = tokio::spawn(server::serve(listener, Arc::clone(&gateway)));
    tokio::select! {
        result = &mut server => {
            result.context("server task failed")?.context("server error")?;
            return Ok(());
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    gateway.shutdown().await;
    match tokio::time::timeout(DRAIN_TIMEOUT, server).await {
        Ok(result) => result.context("server task failed")?.context("server error")?,
        Err(_) => warn!("HTTP drain timed out"),
    }

    info!("chatrelay-gateway stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
