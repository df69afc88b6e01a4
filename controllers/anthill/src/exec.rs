//! Remote command execution and one-shot device wipes.
//!
//! Wiping a device destroys its contents, so every wiped path is recorded on
//! the node's deployment and never wiped again for the lifetime of that
//! deployment.

use crate::error::ControllerError;
use crate::store::ObjectStore;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::{Api, Client};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Deployment annotation listing wiped device paths, comma separated.
pub const WIPED_DEVICES_ANNOTATION: &str = "anthill.gluster.org/wiped-devices";

/// Runs a command inside a pod container.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command` to completion. Cancelling `cancel` aborts the call.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError>;
}

/// [`RemoteExec`] over the pod exec subresource.
#[derive(Clone)]
pub struct KubePodExec {
    client: Client,
}

impl std::fmt::Debug for KubePodExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePodExec").finish_non_exhaustive()
    }
}

impl KubePodExec {
    /// Create an executor using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteExec for KubePodExec {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = AttachParams::default().stdin(false).stdout(true).stderr(true);
        if let Some(container) = container {
            params = params.container(container);
        }

        debug!(namespace, pod, ?command, "Executing in pod");
        let run = async {
            let mut attached = pods
                .exec(pod, command.clone(), &params)
                .await
                .map_err(|e| ControllerError::Exec(format!("exec in {namespace}/{pod} failed: {e}")))?;

            let status = match attached.take_status() {
                Some(status) => status.await,
                None => None,
            };
            attached
                .join()
                .await
                .map_err(|e| ControllerError::Exec(format!("exec in {namespace}/{pod} failed: {e}")))?;

            match status {
                Some(status) if status.status.as_deref() == Some("Failure") => Err(ControllerError::Exec(
                    format!(
                        "{command:?} in {namespace}/{pod} failed: {}",
                        status.message.unwrap_or_default()
                    ),
                )),
                _ => Ok(()),
            }
        };

        tokio::select! {
            result = run => result,
            () = cancel.cancelled() => Err(ControllerError::Exec(format!(
                "exec in {namespace}/{pod} cancelled by shutdown"
            ))),
        }
    }
}

/// Device paths already wiped on a deployment.
#[must_use]
pub fn wiped_devices(deployment: &Deployment) -> BTreeSet<String> {
    deployment
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(WIPED_DEVICES_ANNOTATION))
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|path| !path.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Name of a running pod that is not being deleted.
///
/// Right after a rollout the old pod can still be listed while it terminates.
fn running_pod_name(pods: &[Pod]) -> Option<String> {
    pods.iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .find(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
        .and_then(|p| p.metadata.name.clone())
}

fn record_wiped(deployment: &mut Deployment, wiped: &BTreeSet<String>) {
    let value = wiped.iter().cloned().collect::<Vec<_>>().join(",");
    deployment
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(WIPED_DEVICES_ANNOTATION.to_string(), value);
}

/// Wipes raw devices inside a storage node's pod, at most once per device.
#[derive(Clone)]
pub struct DeviceWiper {
    store: Arc<dyn ObjectStore>,
    exec: Arc<dyn RemoteExec>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DeviceWiper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceWiper").finish_non_exhaustive()
    }
}

impl DeviceWiper {
    pub fn new(store: Arc<dyn ObjectStore>, exec: Arc<dyn RemoteExec>, cancel: CancellationToken) -> Self {
        Self { store, exec, cancel }
    }

    /// Run `wipefs -a` on every device not wiped before.
    ///
    /// The deployment annotation is persisted after each wipe, so an
    /// interrupted pass resumes with the next device. Returns the number of
    /// devices wiped.
    pub async fn wipe(
        &self,
        namespace: &str,
        node: &str,
        container: Option<&str>,
        devices: &[String],
    ) -> Result<usize, ControllerError> {
        let mut deployment = self.store.get_deployment(namespace, node).await?;
        let mut wiped = wiped_devices(&deployment);

        let pending: Vec<&String> = devices.iter().filter(|d| !wiped.contains(*d)).collect();
        if pending.is_empty() {
            debug!(node, "All devices already wiped");
            return Ok(0);
        }

        let pods = self.store.list_pods(namespace, &format!("name={node}")).await?;
        let pod = running_pod_name(&pods).ok_or_else(|| ControllerError::Exec(format!("Node {node} has no running pod")))?;

        for device in &pending {
            info!(node, device = device.as_str(), "Wiping device");
            let command = vec!["wipefs".to_string(), "-a".to_string(), (*device).clone()];
            self.exec
                .exec(namespace, &pod, container, command, &self.cancel)
                .await?;

            wiped.insert((*device).clone());
            record_wiped(&mut deployment, &wiped);
            deployment = self.store.replace_deployment(&deployment).await?;
        }

        Ok(pending.len())
    }
}
