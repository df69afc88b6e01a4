//! Test utilities for unit testing the controller
//!
//! In-memory stand-ins for the Kubernetes collaborators plus builders for
//! test fixtures.

use crate::error::{ControllerError, StoreError};
use crate::events::EventPublisher;
use crate::exec::RemoteExec;
use crate::store::{ObjectKind, ObjectStore};
use crate::topology::TopologyClientFactory;
use crate::watcher::ClusterCache;
use async_trait::async_trait;
use crds::{GlusterCluster, GlusterClusterSpec, Node, NodeVolume};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, LocalVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec,
    Pod, PodStatus, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use topology_client::{MockTopologyClient, TopologyClientTrait};

/// Helper to create a test GlusterCluster with an empty spec
pub fn create_test_cluster(name: &str, namespace: &str, resource_version: &str) -> GlusterCluster {
    GlusterCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{namespace}-{name}")),
            resource_version: Some(resource_version.to_string()),
            ..Default::default()
        },
        spec: GlusterClusterSpec::default(),
        status: None,
    }
}

/// Helper to create a raw data volume backed by a local device
pub fn create_test_volume(name: &str, path: &str) -> NodeVolume {
    NodeVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provision: Some(true),
        spec: PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([("storage".to_string(), Quantity("1Gi".to_string()))])),
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some("test-class".to_string()),
            local: Some(LocalVolumeSource {
                path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

/// Helper to create a raw storage node with `devices` unnamed local devices
pub fn storage_node_with_devices(devices: usize) -> Node {
    Node {
        devices: (0..devices)
            .map(|index| NodeVolume {
                spec: PersistentVolumeSpec {
                    local: Some(LocalVolumeSource {
                        path: format!("/dev/disk/by-id/test-{index}"),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Helper to create a single-replica deployment without status
pub fn create_test_deployment(namespace: &str, name: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            ..Default::default()
        }),
        status: None,
    }
}

/// Overwrite a deployment's rollout status
pub fn set_deployment_status(
    deployment: &mut Deployment,
    updated: i32,
    available: i32,
    replicas: i32,
    observed_generation: i64,
) {
    deployment.status = Some(DeploymentStatus {
        updated_replicas: Some(updated),
        available_replicas: Some(available),
        replicas: Some(replicas),
        observed_generation: Some(observed_generation),
        ..Default::default()
    });
}

/// A pod in the `Running` phase
pub fn running_pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn bump(resource_version: Option<&str>) -> String {
    let current: u64 = resource_version.and_then(|v| v.parse().ok()).unwrap_or(0);
    (current + 1).to_string()
}

type Key = (ObjectKind, String, String);

struct StoreState {
    objects: BTreeMap<Key, serde_json::Value>,
    deployments: BTreeMap<(String, String), Deployment>,
    clusters: BTreeMap<(String, String), GlusterCluster>,
    creates: Vec<(ObjectKind, String)>,
    deletes: Vec<(ObjectKind, String)>,
    already_exists: usize,
    deployment_replaces: usize,
    status_writes: usize,
    pending_status_conflicts: u32,
    pending_deployment_conflicts: BTreeMap<String, u32>,
    failing_creates: BTreeSet<ObjectKind>,
    pods_ready: bool,
    rollouts_complete: bool,
}

/// In-memory [`ObjectStore`] recording every write.
///
/// Created deployments roll out immediately unless
/// [`set_rollouts_complete(false)`](Self::set_rollouts_complete) is called.
#[derive(Clone)]
pub struct MockObjectStore {
    state: Arc<Mutex<StoreState>>,
}

impl std::fmt::Debug for MockObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockObjectStore").finish_non_exhaustive()
    }
}

impl Default for MockObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                objects: BTreeMap::new(),
                deployments: BTreeMap::new(),
                clusters: BTreeMap::new(),
                creates: Vec::new(),
                deletes: Vec::new(),
                already_exists: 0,
                deployment_replaces: 0,
                status_writes: 0,
                pending_status_conflicts: 0,
                pending_deployment_conflicts: BTreeMap::new(),
                failing_creates: BTreeSet::new(),
                pods_ready: true,
                rollouts_complete: true,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    /// Store a deployment as is, bypassing version checks
    pub fn insert_deployment(&self, deployment: Deployment) {
        let key = (deployment.namespace().unwrap_or_default(), deployment.name_any());
        self.state().deployments.insert(key, deployment);
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn insert_cluster(&self, cluster: GlusterCluster) {
        let key = (cluster.namespace().unwrap_or_default(), cluster.name_any());
        self.state().clusters.insert(key, cluster);
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<GlusterCluster> {
        self.state()
            .clusters
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Whether pods exist for stored deployments
    pub fn set_pods_ready(&self, ready: bool) {
        self.state().pods_ready = ready;
    }

    /// Whether new and replaced deployments report a completed rollout
    pub fn set_rollouts_complete(&self, complete: bool) {
        self.state().rollouts_complete = complete;
    }

    /// Make the next `count` status writes fail with a conflict
    pub fn inject_status_conflicts(&self, count: u32) {
        self.state().pending_status_conflicts = count;
    }

    /// Make the next `count` replaces of deployment `name` fail with a conflict
    pub fn inject_deployment_conflicts(&self, name: &str, count: u32) {
        self.state().pending_deployment_conflicts.insert(name.to_string(), count);
    }

    /// Make every create of `kind` fail
    pub fn fail_creates(&self, kind: ObjectKind) {
        self.state().failing_creates.insert(kind);
    }

    /// Names of successfully created objects of `kind`, in creation order
    pub fn created(&self, kind: ObjectKind) -> Vec<String> {
        self.state()
            .creates
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Number of successful creates of any kind
    pub fn create_count(&self) -> usize {
        self.state().creates.len()
    }

    pub fn already_exists_count(&self) -> usize {
        self.state().already_exists
    }

    pub fn deployment_replaces(&self) -> usize {
        self.state().deployment_replaces
    }

    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }

    /// Names of deleted objects of `kind`, in deletion order
    pub fn deleted(&self, kind: ObjectKind) -> Vec<String> {
        self.state()
            .deletes
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn contains(&self, kind: ObjectKind, namespace: &str, name: &str) -> bool {
        let state = self.state();
        if kind == ObjectKind::Deployment {
            return state
                .deployments
                .contains_key(&(namespace.to_string(), name.to_string()));
        }
        let namespace = if kind.cluster_scoped() { "" } else { namespace };
        state
            .objects
            .contains_key(&(kind, namespace.to_string(), name.to_string()))
    }

    /// Stored object of `kind`, as JSON
    pub fn object(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<serde_json::Value> {
        let namespace = if kind.cluster_scoped() { "" } else { namespace };
        self.state()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn create_object<K>(&self, kind: ObjectKind, object: &K) -> Result<(), StoreError>
    where
        K: Resource + Serialize,
    {
        let mut state = self.state();
        if state.failing_creates.contains(&kind) {
            return Err(StoreError::Other(format!("injected {kind} create failure")));
        }

        let namespace = if kind.cluster_scoped() {
            String::new()
        } else {
            object.namespace().unwrap_or_default()
        };
        let name = object.name_any();
        let key = (kind, namespace, name.clone());
        if state.objects.contains_key(&key) {
            state.already_exists += 1;
            return Err(StoreError::AlreadyExists(name));
        }

        let value = serde_json::to_value(object).map_err(|e| StoreError::Other(e.to_string()))?;
        state.objects.insert(key, value);
        state.creates.push((kind, name));
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn create_service(&self, service: &Service) -> Result<(), StoreError> {
        self.create_object(ObjectKind::Service, service)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), StoreError> {
        self.create_object(ObjectKind::ConfigMap, config_map)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), StoreError> {
        self.create_object(ObjectKind::Secret, secret)
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), StoreError> {
        self.create_object(ObjectKind::ServiceAccount, account)
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), StoreError> {
        self.create_object(ObjectKind::RoleBinding, binding)
    }

    async fn create_storage_class(&self, class: &StorageClass) -> Result<(), StoreError> {
        self.create_object(ObjectKind::StorageClass, class)
    }

    async fn create_persistent_volume(&self, volume: &PersistentVolume) -> Result<(), StoreError> {
        self.create_object(ObjectKind::PersistentVolume, volume)
    }

    async fn create_persistent_volume_claim(&self, claim: &PersistentVolumeClaim) -> Result<(), StoreError> {
        self.create_object(ObjectKind::PersistentVolumeClaim, claim)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        let mut state = self.state();
        if state.failing_creates.contains(&ObjectKind::Deployment) {
            return Err(StoreError::Other("injected Deployment create failure".to_string()));
        }

        let name = deployment.name_any();
        let key = (deployment.namespace().unwrap_or_default(), name.clone());
        if state.deployments.contains_key(&key) {
            state.already_exists += 1;
            return Err(StoreError::AlreadyExists(name));
        }

        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some("1".to_string());
        stored.metadata.generation = Some(1);
        if state.rollouts_complete {
            set_deployment_status(&mut stored, 1, 1, 1, 1);
        }
        state.deployments.insert(key, stored.clone());
        state.creates.push((ObjectKind::Deployment, name));
        Ok(stored)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        self.deployment(namespace, name)
            .ok_or_else(|| StoreError::NotFound(format!("deployment {namespace}/{name}")))
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        let mut state = self.state();
        let name = deployment.name_any();
        let key = (deployment.namespace().unwrap_or_default(), name.clone());
        let rollouts_complete = state.rollouts_complete;

        let injected = match state.pending_deployment_conflicts.get_mut(&name) {
            Some(pending) if *pending > 0 => {
                *pending -= 1;
                true
            }
            _ => false,
        };

        let Some(current) = state.deployments.get_mut(&key) else {
            return Err(StoreError::NotFound(format!("deployment {name}")));
        };
        if injected {
            // A rollout status write landed in between
            current.metadata.resource_version = Some(bump(current.metadata.resource_version.as_deref()));
        }
        if current.metadata.resource_version != deployment.metadata.resource_version {
            return Err(StoreError::Conflict(format!("deployment {name} was modified")));
        }

        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(bump(current.metadata.resource_version.as_deref()));
        let generation = current.metadata.generation.unwrap_or(0) + 1;
        stored.metadata.generation = Some(generation);
        if rollouts_complete {
            set_deployment_status(&mut stored, 1, 1, 1, generation);
        }
        state.deployments.insert(key, stored.clone());
        state.deployment_replaces += 1;
        Ok(stored)
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        let removed = if kind == ObjectKind::Deployment {
            state
                .deployments
                .remove(&(namespace.to_string(), name.to_string()))
                .is_some()
        } else {
            let namespace = if kind.cluster_scoped() { "" } else { namespace };
            state
                .objects
                .remove(&(kind, namespace.to_string(), name.to_string()))
                .is_some()
        };

        if !removed {
            return Err(StoreError::NotFound(format!("{kind} {name}")));
        }
        state.deletes.push((kind, name.to_string()));
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, StoreError> {
        let state = self.state();
        let Some(node) = label_selector.strip_prefix("name=") else {
            return Ok(Vec::new());
        };
        let exists = state
            .deployments
            .contains_key(&(namespace.to_string(), node.to_string()));
        if !(state.pods_ready && exists) {
            return Ok(Vec::new());
        }

        Ok(vec![running_pod(namespace, &format!("{node}-pod"))])
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<GlusterCluster, StoreError> {
        self.cluster(namespace, name)
            .ok_or_else(|| StoreError::NotFound(format!("cluster {namespace}/{name}")))
    }

    async fn update_cluster_status(&self, cluster: &GlusterCluster) -> Result<GlusterCluster, StoreError> {
        let mut state = self.state();
        let name = cluster.name_any();
        let key = (cluster.namespace().unwrap_or_default(), name.clone());
        let injected = state.pending_status_conflicts > 0;

        let Some(current) = state.clusters.get_mut(&key) else {
            return Err(StoreError::NotFound(format!("cluster {name}")));
        };
        if injected {
            // Someone else wrote the object in between
            current.metadata.resource_version = Some(bump(current.metadata.resource_version.as_deref()));
        }
        if current.metadata.resource_version != cluster.metadata.resource_version {
            if injected {
                state.pending_status_conflicts -= 1;
            }
            return Err(StoreError::Conflict(format!("cluster {name} was modified")));
        }

        current.status.clone_from(&cluster.status);
        current.metadata.resource_version = Some(bump(current.metadata.resource_version.as_deref()));
        let stored = current.clone();
        state.status_writes += 1;
        Ok(stored)
    }
}

/// [`RemoteExec`] recording every command.
#[derive(Clone, Default)]
pub struct MockRemoteExec {
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    failing: Arc<Mutex<BTreeSet<String>>>,
}

impl std::fmt::Debug for MockRemoteExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRemoteExec").finish_non_exhaustive()
    }
}

impl MockRemoteExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands that ran successfully
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    /// Fail any command mentioning `argument`
    pub fn fail_on(&self, argument: &str) {
        self.failing.lock().unwrap().insert(argument.to_string());
    }
}

#[async_trait]
impl RemoteExec for MockRemoteExec {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        _container: Option<&str>,
        command: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<(), ControllerError> {
        if cancel.is_cancelled() {
            return Err(ControllerError::Exec("cancelled".to_string()));
        }
        if command.iter().any(|arg| self.failing.lock().unwrap().contains(arg)) {
            return Err(ControllerError::Exec(format!("{command:?} failed in {pod}")));
        }
        self.commands.lock().unwrap().push(command);
        Ok(())
    }
}

/// A published event
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub object: String,
    pub type_: EventType,
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

/// [`EventPublisher`] keeping events in memory
#[derive(Clone, Debug, Default)]
pub struct RecordingEventPublisher {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Reasons of all events, in publication order
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: resource_ref.name.clone().unwrap_or_default(),
            type_,
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

/// Every cluster shares the one in-memory topology manager
impl TopologyClientFactory for MockTopologyClient {
    fn client_for(&self, _cluster: &GlusterCluster) -> Result<Arc<dyn TopologyClientTrait>, ControllerError> {
        Ok(Arc::new(self.clone()))
    }
}

/// [`ClusterCache`] backed by a map
#[derive(Clone, Debug, Default)]
pub struct MockClusterCache {
    clusters: Arc<Mutex<BTreeMap<(String, String), Arc<GlusterCluster>>>>,
}

impl MockClusterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cluster: GlusterCluster) {
        let key = (cluster.namespace().unwrap_or_default(), cluster.name_any());
        self.clusters.lock().unwrap().insert(key, Arc::new(cluster));
    }
}

impl ClusterCache for MockClusterCache {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<GlusterCluster>> {
        self.clusters
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}
