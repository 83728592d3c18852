//! `chatrelay run`: connect and relay until interrupted.

use anyhow::{Context, Result};
use chatrelay_client::{ConnectionState, RelayClient};
use chatrelay_core::RelayError;
use chatrelay_platform::PlatformApi;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentBridge;
use crate::config::Config;

pub async fn run(path: &Path) -> Result<()> {
    let cfg = Config::load(path)?;
    let connect = cfg.connect_config()?;
    let platform = cfg
        .platform()?
        .map(|api| Arc::new(api) as Arc<dyn PlatformApi>);
    let agent = AgentBridge::new(&cfg.agent);

    info!(
        gateway = %connect.url,
        user = %connect.user_id,
        agent = %agent.describe(),
        direct_media = platform.is_some(),
        "starting chatrelay"
    );

    let client = RelayClient::new(connect, Arc::new(agent), platform);
    let cancel = CancellationToken::new();

    let mut state = client.state();
    let watcher = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();
            match current {
                ConnectionState::Connected { session_id } => {
                    info!(session_id = %session_id, "connected to gateway")
                }
                ConnectionState::Disconnected => warn!("disconnected from gateway"),
                other => tracing::debug!(state = ?other, "connection state"),
            }
        }
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_cancel.cancel();
    });

    let result = client.run(cancel).await;
    watcher.abort();

    match result {
        Ok(()) => Ok(()),
        Err(RelayError::Evicted) => {
            anyhow::bail!("another client took over the gateway session")
        }
        Err(e) => Err(e).context("relay client stopped"),
    }
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
