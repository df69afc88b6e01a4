//! Controller-specific error types.
//!
//! This module defines the error taxonomy of the Anthill controller. Errors
//! in the "drop" class end processing of a work item without a retry; every
//! other error re-queues the item with backoff.

use kube::Error as KubeError;
use thiserror::Error;
use topology_client::TopologyError;

/// Errors returned by object-store calls.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed
    #[error("conflict: {0}")]
    Conflict(String),

    /// The object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other Kubernetes API failure
    #[error("Kubernetes error: {0}")]
    Kube(#[source] KubeError),

    /// Failure outside the Kubernetes client
    #[error("{0}")]
    Other(String),
}

impl From<KubeError> for StoreError {
    fn from(error: KubeError) -> Self {
        match &error {
            KubeError::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(response.message.clone())
            }
            KubeError::Api(response) if response.code == 409 => {
                StoreError::Conflict(response.message.clone())
            }
            KubeError::Api(response) if response.code == 404 => {
                StoreError::NotFound(response.message.clone())
            }
            _ => StoreError::Kube(error),
        }
    }
}

/// Errors that can occur in the Anthill controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Work item payload is unusable (no name, namespace or spec)
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// The cache already holds a newer version of the resource
    #[error("Stale event: {0}")]
    StaleEvent(String),

    /// Nothing to do (resync or status-only change)
    #[error("No-op event: {0}")]
    NoopEvent(String),

    /// Effective state could not be computed from the spec
    #[error("Defaulting failed: {0}")]
    Defaulting(String),

    /// Dependent object could not be created, updated or deleted
    #[error("Orchestration failed: {0}")]
    Orchestration(#[from] StoreError),

    /// Deployment did not converge in time
    #[error("Rollout of {name} did not complete within {timeout_secs}s")]
    RolloutTimeout {
        /// Deployment name
        name: String,
        /// Timeout that elapsed
        timeout_secs: u64,
    },

    /// Polling a deployment failed
    #[error("Polling deployment {name} failed: {source}")]
    Poll {
        /// Deployment name
        name: String,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },

    /// Topology manager API error
    #[error("Topology manager error: {0}")]
    Topology(#[from] TopologyError),

    /// Status write-back kept conflicting after every retry
    #[error("Status update conflict: {0}")]
    StatusConflict(String),

    /// Remote command execution failed
    #[error("Remote exec failed: {0}")]
    Exec(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Kubernetes client bootstrap error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),
}

impl ControllerError {
    /// Whether the error ends processing without a retry.
    #[must_use]
    pub fn is_drop(&self) -> bool {
        matches!(
            self,
            ControllerError::MalformedEvent(_)
                | ControllerError::StaleEvent(_)
                | ControllerError::NoopEvent(_)
        )
    }
}
