//! Command line and environment configuration.
//!
//! Every flag can also be set through an environment variable so the
//! controller can be configured from its Deployment manifest.

use clap::{Parser, Subcommand};
use std::time::Duration;

/// Default number of workers pulling from the queue.
pub const DEFAULT_THREADINESS: usize = 2;

/// Anthill: reconciles GlusterCluster resources.
#[derive(Debug, Parser)]
#[command(name = "anthill", about = "Kubernetes controller for GlusterFS clusters")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the controller until SIGINT/SIGTERM (default)
    Run,
    /// Print the controller version
    Version,
}

/// Settings for the `run` command.
#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE", global = true)]
    pub namespace: Option<String>,

    /// Number of queue workers
    #[arg(long, env = "ANTHILL_THREADINESS", default_value_t = DEFAULT_THREADINESS, global = true)]
    pub threadiness: usize,

    /// Seconds between deployment rollout polls
    #[arg(long, env = "ANTHILL_ROLLOUT_POLL_SECS", default_value_t = 2, global = true)]
    pub rollout_poll_interval_secs: u64,

    /// Retries of a conflicting status update
    #[arg(long, env = "ANTHILL_STATUS_RETRIES", default_value_t = 5, global = true)]
    pub status_retries: u32,

    /// Cluster role bound to the topology manager's service account
    #[arg(long, env = "ANTHILL_CLUSTER_ROLE", default_value = "anthill", global = true)]
    pub cluster_role: String,
}

impl RunArgs {
    /// Validate flag combinations clap cannot express.
    pub fn validate(&self) -> Result<(), crate::error::ControllerError> {
        if self.threadiness == 0 {
            return Err(crate::error::ControllerError::InvalidConfig(
                "threadiness must be at least 1".to_string(),
            ));
        }
        if self.rollout_poll_interval_secs == 0 {
            return Err(crate::error::ControllerError::InvalidConfig(
                "rollout poll interval must be at least 1s".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval between rollout polls.
    #[must_use]
    pub fn rollout_poll_interval(&self) -> Duration {
        Duration::from_secs(self.rollout_poll_interval_secs)
    }
}

/// Version string printed by `anthill version`.
#[must_use]
pub fn version() -> String {
    format!("Anthill {}", env!("CARGO_PKG_VERSION"))
}
