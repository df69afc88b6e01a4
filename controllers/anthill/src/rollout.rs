//! Deployment rollout waiter.

use crate::error::ControllerError;
use crate::store::ObjectStore;
use k8s_openapi::api::apps::v1::Deployment;
use std::time::Duration;
use tracing::debug;

/// Whether a deployment has converged on its desired state.
///
/// Converged when the updated, available and observed replica counts all
/// equal the desired count and the controller has observed the current
/// generation.
#[must_use]
pub fn deployment_converged(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };

    let generation = deployment.metadata.generation.unwrap_or(0);
    status.updated_replicas.unwrap_or(0) == desired
        && status.available_replicas.unwrap_or(0) == desired
        && status.replicas.unwrap_or(0) == desired
        && status.observed_generation.unwrap_or(0) >= generation
}

/// Poll a deployment until it converges.
///
/// Checks immediately, then every `interval`. Fails with
/// [`ControllerError::RolloutTimeout`] once `timeout` elapses and with
/// [`ControllerError::Poll`] as soon as a read fails.
pub async fn wait_for_rollout(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<(), ControllerError> {
    let poll = async {
        loop {
            let deployment = store
                .get_deployment(namespace, name)
                .await
                .map_err(|source| ControllerError::Poll {
                    name: name.to_string(),
                    source,
                })?;
            if deployment_converged(&deployment) {
                return Ok(());
            }
            debug!(namespace, deployment = name, "Waiting for rollout");
            tokio::time::sleep(interval).await;
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(result) => result,
        Err(_) => Err(ControllerError::RolloutTimeout {
            name: name.to_string(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}
