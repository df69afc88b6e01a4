//! Resource orchestrator.
//!
//! Creates, updates and deletes the objects realizing one node or volume.
//! Every create treats an existing object as success and every delete treats
//! a missing object as success, so a pass can be repeated after a partial
//! failure.

pub mod objects;

use crate::defaults::{device_path, kernel_modules_volume};
use crate::diff::{UpdateVolume, VolumeAction, diff_node};
use crate::error::{ControllerError, StoreError};
use crate::exec::DeviceWiper;
use crate::rollout::wait_for_rollout;
use crate::store::{ObjectKind, ObjectStore};
use crds::{GlusterCluster, HeketiSpec, Node, NodeVolume};
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_ROLLOUT_TIMEOUT: Duration = Duration::from_secs(300);

/// Accept `AlreadyExists` as a successful create.
fn created(result: Result<(), StoreError>, kind: ObjectKind, name: &str) -> Result<(), ControllerError> {
    match result {
        Ok(()) => {
            info!(kind = %kind, name, "Created");
            Ok(())
        }
        Err(StoreError::AlreadyExists(_)) => {
            debug!(kind = %kind, name, "Already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Accept `NotFound` as a successful delete.
fn deleted(result: Result<(), StoreError>, kind: ObjectKind, name: &str) -> Result<(), ControllerError> {
    match result {
        Ok(()) => {
            info!(kind = %kind, name, "Deleted");
            Ok(())
        }
        Err(StoreError::NotFound(_)) => {
            debug!(kind = %kind, name, "Already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn rollout_timeout(node: &Node) -> Duration {
    node.timeout
        .and_then(|secs| u64::try_from(secs).ok())
        .filter(|secs| *secs > 0)
        .map_or(DEFAULT_ROLLOUT_TIMEOUT, Duration::from_secs)
}

/// Raw device paths attached to a node's storage container.
pub fn attached_devices(node: &Node) -> Vec<String> {
    node.spec
        .containers
        .first()
        .and_then(|c| c.volume_devices.as_ref())
        .map(|devices| devices.iter().map(|d| d.device_path.clone()).collect())
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    wiper: DeviceWiper,
    poll_interval: Duration,
    cluster_role: String,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("poll_interval", &self.poll_interval)
            .field("cluster_role", &self.cluster_role)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        wiper: DeviceWiper,
        poll_interval: Duration,
        cluster_role: impl Into<String>,
    ) -> Self {
        Self {
            store,
            wiper,
            poll_interval,
            cluster_role: cluster_role.into(),
        }
    }

    pub async fn create_service(&self, cluster: &GlusterCluster) -> Result<(), ControllerError> {
        let service = objects::service(cluster);
        let result = self.store.create_service(&service).await;
        created(result, ObjectKind::Service, &cluster.name_any())
    }

    /// Create the topology manager config map and its database secret.
    pub async fn create_topology_config(&self, heketi: &HeketiSpec) -> Result<(), ControllerError> {
        let node = topology_node(heketi)?;
        let config = heketi.config.clone().unwrap_or_default();

        let config_map = objects::config_map(node, &config)
            .map_err(|e| ControllerError::Defaulting(format!("cannot serialize topology config: {e}")))?;
        let result = self.store.create_config_map(&config_map).await;
        created(result, ObjectKind::ConfigMap, &objects::config_map_name(node))?;

        let result = self.store.create_secret(&objects::db_secret(node)).await;
        created(result, ObjectKind::Secret, &objects::db_secret_name(node))
    }

    /// Create the service account of a topology manager node and bind it to the cluster role.
    pub async fn create_credentials(&self, node: &Node) -> Result<(), ControllerError> {
        let result = self.store.create_service_account(&objects::service_account(node)).await;
        created(result, ObjectKind::ServiceAccount, &objects::service_account_name(node))?;

        let binding = objects::role_binding(node, &self.cluster_role);
        let result = self.store.create_role_binding(&binding).await;
        created(result, ObjectKind::RoleBinding, &objects::role_binding_name(node))
    }

    /// Create the storage class and persistent volume of a provisioned volume, then its claim.
    pub async fn create_volume_resources(&self, volume: &NodeVolume) -> Result<(), ControllerError> {
        debug!(volume = volume.name(), "Creating volume resources");

        if volume.provisioned() {
            if let Some(class) = objects::storage_class(volume) {
                let result = self.store.create_storage_class(&class).await;
                created(result, ObjectKind::StorageClass, &class.name_any())?;
            }
            let result = self
                .store
                .create_persistent_volume(&objects::persistent_volume(volume))
                .await;
            created(result, ObjectKind::PersistentVolume, volume.name())?;
        }

        let result = self
            .store
            .create_persistent_volume_claim(&objects::persistent_volume_claim(volume))
            .await;
        created(result, ObjectKind::PersistentVolumeClaim, &volume.claim_name())
    }

    /// Create the state and kernel-modules volumes of a storage node.
    pub async fn create_mount_volumes(&self, node: &Node) -> Result<(), ControllerError> {
        if let Some(state) = &node.state_volume {
            info!(node = node.name(), "Creating state volume");
            self.create_volume_resources(state).await?;
        }
        info!(node = node.name(), "Creating kernel modules volume");
        self.create_volume_resources(&kernel_modules_volume(node)).await
    }

    /// Create a node's deployment and wait for its rollout.
    ///
    /// Returns `false` without waiting when the deployment already existed.
    pub async fn create_deployment(&self, node: &Node) -> Result<bool, ControllerError> {
        match self.store.create_deployment(&objects::deployment(node)).await {
            Ok(_) => {
                info!(node = node.name(), "Created deployment");
                wait_for_rollout(
                    self.store.as_ref(),
                    node.namespace(),
                    node.name(),
                    self.poll_interval,
                    rollout_timeout(node),
                )
                .await?;
                Ok(true)
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(node = node.name(), "Deployment already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bring up one node with everything it depends on.
    pub async fn deploy_node(&self, node: &Node, wipe: bool) -> Result<(), ControllerError> {
        info!(node = node.name(), "Processing node");

        if node.is_storage() {
            self.create_mount_volumes(node).await?;
            for volume in &node.devices {
                info!(node = node.name(), volume = volume.name(), "Processing device");
                self.create_volume_resources(volume).await?;
            }
        } else {
            self.create_credentials(node).await?;
        }

        self.create_deployment(node).await?;

        if node.is_storage() && wipe {
            self.wipe(node, &attached_devices(node)).await?;
        }
        Ok(())
    }

    async fn wipe(&self, node: &Node, devices: &[String]) -> Result<(), ControllerError> {
        let container = node.spec.containers.first().map(|c| c.name.as_str());
        let wiped = self
            .wiper
            .wipe(node.namespace(), node.name(), container, devices)
            .await?;
        debug!(node = node.name(), wiped, "Device wipe finished");
        Ok(())
    }

    /// Apply the volume changes between two versions of a storage node.
    ///
    /// Returns `false` when no volume changed; other node changes are not
    /// rolled out.
    pub async fn update_node(&self, old: &Node, new: &Node, wipe: bool) -> Result<bool, ControllerError> {
        let updates = diff_node(old, new);
        if updates.is_empty() {
            debug!(node = new.name(), "No volume changes");
            return Ok(false);
        }

        let mut deployment = self.store.get_deployment(new.namespace(), new.name()).await?;

        for update in &updates {
            self.apply_volume_update(update).await?;
        }

        let template = deployment
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
            .ok_or_else(|| StoreError::Other(format!("deployment {} has no pod template", new.name())))?;
        template.volumes.clone_from(&new.spec.volumes);
        template.init_containers.clone_from(&new.spec.init_containers);
        if let (Some(container), Some(desired)) = (template.containers.first_mut(), new.spec.containers.first()) {
            container.volume_devices.clone_from(&desired.volume_devices);
        }

        self.store.replace_deployment(&deployment).await?;
        info!(node = new.name(), changes = updates.len(), "Updated deployment volumes");

        wait_for_rollout(
            self.store.as_ref(),
            new.namespace(),
            new.name(),
            self.poll_interval,
            rollout_timeout(new),
        )
        .await?;

        if wipe {
            let added: Vec<String> = updates
                .iter()
                .filter(|u| !u.is_state_volume)
                .filter_map(|u| u.new.as_ref())
                .map(device_path)
                .collect();
            self.wipe(new, &added).await?;
        }

        Ok(true)
    }

    async fn apply_volume_update(&self, update: &UpdateVolume) -> Result<(), ControllerError> {
        match (update.action(), &update.old, &update.new) {
            (VolumeAction::Create, _, Some(new)) => self.create_volume_resources(new).await,
            (VolumeAction::Remove, Some(old), _) => self.remove_volume(old).await,
            (VolumeAction::Replace, Some(old), Some(new)) => {
                if old.name() != new.name() {
                    self.remove_volume(old).await?;
                }
                self.create_volume_resources(new).await
            }
            _ => Ok(()),
        }
    }

    /// Delete a volume's claim and, if provisioned, its persistent volume.
    ///
    /// Storage classes may be shared between volumes and are left in place.
    pub async fn remove_volume(&self, volume: &NodeVolume) -> Result<(), ControllerError> {
        let namespace = volume.metadata.namespace.as_deref().unwrap_or_default();
        let claim = volume.claim_name();
        let result = self
            .store
            .delete(ObjectKind::PersistentVolumeClaim, namespace, &claim)
            .await;
        deleted(result, ObjectKind::PersistentVolumeClaim, &claim)?;

        if volume.provisioned() {
            let result = self
                .store
                .delete(ObjectKind::PersistentVolume, namespace, volume.name())
                .await;
            deleted(result, ObjectKind::PersistentVolume, volume.name())?;
        }
        Ok(())
    }

    /// Delete a node's deployment and, for storage nodes, all of its volumes.
    pub async fn remove_node(&self, node: &Node) -> Result<(), ControllerError> {
        info!(node = node.name(), "Removing node");
        let result = self
            .store
            .delete(ObjectKind::Deployment, node.namespace(), node.name())
            .await;
        deleted(result, ObjectKind::Deployment, node.name())?;

        if !node.is_storage() {
            return Ok(());
        }

        let mut volumes: Vec<NodeVolume> = node.state_volume.iter().cloned().collect();
        volumes.push(kernel_modules_volume(node));
        volumes.extend(node.devices.iter().cloned());

        let mut classes = BTreeSet::new();
        for volume in &volumes {
            self.remove_volume(volume).await?;
            if volume.provisioned() {
                classes.extend(objects::storage_class(volume).and_then(|c| c.metadata.name));
            }
        }
        for class in &classes {
            let result = self.store.delete(ObjectKind::StorageClass, "", class).await;
            deleted(result, ObjectKind::StorageClass, class)?;
        }
        Ok(())
    }

    /// Delete every object derived from a defaulted cluster.
    pub async fn teardown(&self, cluster: &GlusterCluster) -> Result<(), ControllerError> {
        let namespace = cluster.namespace().unwrap_or_default();

        for node in &cluster.spec.nodes {
            self.remove_node(node).await?;
        }

        if let Some(heketi) = &cluster.spec.heketi {
            let node = topology_node(heketi)?;
            self.remove_node(node).await?;

            let owned = [
                (ObjectKind::ConfigMap, objects::config_map_name(node)),
                (ObjectKind::Secret, objects::db_secret_name(node)),
                (ObjectKind::RoleBinding, objects::role_binding_name(node)),
                (ObjectKind::ServiceAccount, objects::service_account_name(node)),
            ];
            for (kind, name) in owned {
                let result = self.store.delete(kind, node.namespace(), &name).await;
                deleted(result, kind, &name)?;
            }
        }

        let name = cluster.name_any();
        let result = self.store.delete(ObjectKind::Service, &namespace, &name).await;
        deleted(result, ObjectKind::Service, &name)
    }
}

fn topology_node(heketi: &HeketiSpec) -> Result<&Node, ControllerError> {
    heketi
        .node
        .as_ref()
        .ok_or_else(|| ControllerError::Defaulting("topology manager node missing".to_string()))
}
