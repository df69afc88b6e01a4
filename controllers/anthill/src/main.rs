//! Anthill Controller
//!
//! Reconciles GlusterCluster resources into running GlusterFS storage:
//! - a headless service and a topology manager (heketi) deployment
//! - one deployment per storage node with its volumes and raw devices
//! - the cluster, node and device records in the topology manager
//!
//! Every flag can be given as an environment variable; see `anthill --help`.

mod backoff;
mod config;
mod controller;
mod coordinator;
mod defaults;
mod diff;
mod error;
mod events;
mod exec;
mod orchestrator;
mod queue;
mod rollout;
mod store;
mod topology;
mod watcher;

#[cfg(test)]
pub mod test_utils;

use clap::Parser;
use config::{Cli, Command};
use controller::Controller;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Version => println!("{}", config::version()),
        Command::Run => {
            info!("Starting {}", config::version());

            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_on_signal(cancel.clone()));

            let controller = Controller::new(cli.run).await?;
            controller.run(cancel).await?;
            info!("Anthill controller stopped");
        }
    }

    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_on_signal(token: CancellationToken) {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = interrupt => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = interrupt.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }

    info!("Termination signal received");
    token.cancel();
}
