//! Topology manager synchronization.
//!
//! Keeps the topology manager's cluster, node and device records in step
//! with the deployments this controller runs. Remote IDs are cached in a
//! [`RemoteIdTable`] and written through to labels on the deployments, so
//! they survive restarts and an existing ID is never registered twice.

use crate::defaults::STORAGE_HOST_LABEL;
use crate::error::{ControllerError, StoreError};
use crate::store::ObjectStore;
use crds::{GlusterCluster, Node};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use topology_client::{
    ClusterCreateRequest, DeviceAddRequest, Hostnames, NodeAddRequest, NodeInfo, TopologyClient,
    TopologyClientTrait, TopologyError,
};
use tracing::{debug, info};

/// Deployment label holding the remote cluster ID.
pub const CLUSTER_ID_LABEL: &str = "topology-cluster-id";
/// Deployment label holding the remote node ID.
pub const NODE_ID_LABEL: &str = "topology-node-id";

/// Attempts at writing ID labels onto a deployment.
pub const LABEL_WRITE_ATTEMPTS: u32 = 3;

const ADMIN_USER: &str = "admin";
const DEFAULT_ZONE: i32 = 1;

/// Builds a topology manager client for a defaulted cluster.
pub trait TopologyClientFactory: Send + Sync {
    fn client_for(&self, cluster: &GlusterCluster) -> Result<Arc<dyn TopologyClientTrait>, ControllerError>;
}

/// Connects to the in-cluster topology manager through the headless service.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeketiClientFactory;

/// Base URL of a cluster's topology manager: `http://<node>.<cluster>:<port>`.
pub fn topology_url(cluster: &GlusterCluster) -> Result<String, ControllerError> {
    let heketi = cluster
        .spec
        .heketi
        .as_ref()
        .ok_or_else(|| ControllerError::Defaulting("topology manager spec missing".to_string()))?;
    let node = heketi
        .node
        .as_ref()
        .ok_or_else(|| ControllerError::Defaulting("topology manager node missing".to_string()))?;
    let port = heketi
        .config
        .as_ref()
        .and_then(|c| c.port.as_deref())
        .ok_or_else(|| ControllerError::Defaulting("topology manager port missing".to_string()))?;

    Ok(format!("http://{}.{}:{port}", node.name(), cluster.name_any()))
}

impl TopologyClientFactory for HeketiClientFactory {
    fn client_for(&self, cluster: &GlusterCluster) -> Result<Arc<dyn TopologyClientTrait>, ControllerError> {
        let url = topology_url(cluster)?;
        let config = cluster
            .spec
            .heketi
            .as_ref()
            .and_then(|h| h.config.as_ref());
        let key = config
            .filter(|c| c.use_auth.unwrap_or(false))
            .and_then(|c| c.admin_key())
            .map(str::to_string);

        debug!(url = %url, auth = key.is_some(), "Connecting to topology manager");
        let client = TopologyClient::new(url, ADMIN_USER.to_string(), key)?;
        Ok(Arc::new(client))
    }
}

/// Remote IDs known to this process, keyed by `namespace/name` of the owner.
#[derive(Debug, Default)]
pub struct RemoteIdTable {
    clusters: Mutex<HashMap<String, String>>,
    nodes: Mutex<HashMap<String, (String, String)>>,
}

impl RemoteIdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cluster_id(&self, key: &str) -> Option<String> {
        self.clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set_cluster_id(&self, key: &str, id: &str) {
        self.clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), id.to_string());
    }

    /// `(remote cluster id, remote node id)` of a node.
    pub fn node_ids(&self, key: &str) -> Option<(String, String)> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set_node_ids(&self, key: &str, cluster_id: &str, node_id: &str) {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (cluster_id.to_string(), node_id.to_string()));
    }

    /// Drop every entry of a cluster and the given nodes.
    pub fn forget(&self, cluster_key: &str, node_keys: &[String]) {
        self.clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cluster_key);
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        for key in node_keys {
            nodes.remove(key);
        }
    }
}

fn label(deployment: &Deployment, key: &str) -> Option<String> {
    deployment
        .labels()
        .get(key)
        .filter(|value| !value.is_empty())
        .cloned()
}

fn template_devices(deployment: &Deployment) -> Vec<String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.containers.first())
        .and_then(|c| c.volume_devices.as_ref())
        .map(|devices| devices.iter().map(|d| d.device_path.clone()).collect())
        .unwrap_or_default()
}

/// Key of a node in the [`RemoteIdTable`].
pub fn node_key(node: &Node) -> String {
    format!("{}/{}", node.namespace(), node.name())
}

/// Topology synchronization for one cluster.
pub struct TopologySync {
    client: Arc<dyn TopologyClientTrait>,
    store: Arc<dyn ObjectStore>,
    ids: Arc<RemoteIdTable>,
    cluster_key: String,
    namespace: String,
    manager: String,
    cluster_id: Option<String>,
}

impl std::fmt::Debug for TopologySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologySync")
            .field("cluster", &self.cluster_key)
            .field("cluster_id", &self.cluster_id)
            .finish_non_exhaustive()
    }
}

impl TopologySync {
    /// Sync state for a defaulted cluster.
    pub fn new(
        client: Arc<dyn TopologyClientTrait>,
        store: Arc<dyn ObjectStore>,
        ids: Arc<RemoteIdTable>,
        cluster: &GlusterCluster,
    ) -> Result<Self, ControllerError> {
        let manager = cluster
            .spec
            .heketi
            .as_ref()
            .and_then(|h| h.node.as_ref())
            .ok_or_else(|| ControllerError::Defaulting("topology manager node missing".to_string()))?;

        Ok(Self {
            client,
            store,
            ids,
            cluster_key: format!("{}/{}", cluster.namespace().unwrap_or_default(), cluster.name_any()),
            namespace: manager.namespace().to_string(),
            manager: manager.name().to_string(),
            cluster_id: None,
        })
    }

    /// Make sure the remote cluster exists, returning its ID.
    ///
    /// A known ID is verified against the manager's cluster list; a missing
    /// or unknown one is replaced by a newly created cluster.
    pub async fn ensure_cluster(&mut self) -> Result<String, ControllerError> {
        let deployment = self.store.get_deployment(&self.namespace, &self.manager).await?;
        let known = label(&deployment, CLUSTER_ID_LABEL).or_else(|| self.ids.cluster_id(&self.cluster_key));

        let id = match known {
            Some(id) if self.client.list_clusters().await?.contains(&id) => {
                debug!(cluster = %self.cluster_key, id = %id, "Remote cluster exists");
                id
            }
            _ => {
                let created = self
                    .client
                    .create_cluster(&ClusterCreateRequest { file: true, block: true })
                    .await?;
                info!(cluster = %self.cluster_key, id = %created.id, "Created remote cluster");
                created.id
            }
        };

        self.ids.set_cluster_id(&self.cluster_key, &id);
        self.persist_labels(deployment, &[(CLUSTER_ID_LABEL, &id)]).await?;
        self.cluster_id = Some(id.clone());
        Ok(id)
    }

    fn current_cluster_id(&self) -> Result<&str, ControllerError> {
        self.cluster_id.as_deref().ok_or_else(|| {
            ControllerError::Topology(TopologyError::InvalidRequest(format!(
                "remote cluster of {} not ensured",
                self.cluster_key
            )))
        })
    }

    /// Make sure a storage node and all of its devices are registered.
    pub async fn ensure_node(&self, node: &Node) -> Result<NodeInfo, ControllerError> {
        let cluster_id = self.current_cluster_id()?.to_string();
        let key = node_key(node);
        let deployment = self.store.get_deployment(node.namespace(), node.name()).await?;

        let known = match (label(&deployment, CLUSTER_ID_LABEL), label(&deployment, NODE_ID_LABEL)) {
            (Some(cluster), Some(id)) => Some((cluster, id)),
            _ => self.ids.node_ids(&key),
        };

        if let Some((_, id)) = known.filter(|(cluster, _)| *cluster == cluster_id) {
            match self.client.get_node(&id).await {
                Ok(info) if info.cluster == cluster_id => {
                    debug!(node = %key, id = %id, "Remote node exists");
                    self.ids.set_node_ids(&key, &cluster_id, &id);
                    let deployment = self
                        .persist_labels(deployment, &[(CLUSTER_ID_LABEL, &cluster_id), (NODE_ID_LABEL, &id)])
                        .await?;
                    self.ensure_devices(&template_devices(&deployment), &info).await?;
                    return Ok(info);
                }
                Ok(_) | Err(TopologyError::NotFound(_)) => {
                    info!(node = %key, id = %id, "Remote node gone, registering again");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let hostname = node
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(STORAGE_HOST_LABEL))
            .cloned()
            .ok_or_else(|| ControllerError::Defaulting(format!("node {key} has no {STORAGE_HOST_LABEL} label")))?;

        let info = match self.find_node(&cluster_id, &hostname).await? {
            Some(info) => {
                info!(node = %key, id = %info.id, "Adopted remote node registered under {hostname}");
                info
            }
            None => {
                let info = self
                    .client
                    .add_node(&NodeAddRequest {
                        zone: node.zone.unwrap_or(DEFAULT_ZONE),
                        hostnames: Hostnames {
                            manage: vec![hostname.clone()],
                            storage: vec![hostname],
                        },
                        cluster: cluster_id,
                    })
                    .await?;
                info!(node = %key, id = %info.id, "Registered remote node");
                info
            }
        };

        self.ids.set_node_ids(&key, &info.cluster, &info.id);
        let deployment = self
            .persist_labels(deployment, &[(CLUSTER_ID_LABEL, &info.cluster), (NODE_ID_LABEL, &info.id)])
            .await?;

        self.ensure_devices(&template_devices(&deployment), &info).await?;
        Ok(info)
    }

    /// Node of the remote cluster already managing `hostname`, if any.
    async fn find_node(&self, cluster_id: &str, hostname: &str) -> Result<Option<NodeInfo>, ControllerError> {
        let cluster = self.client.get_cluster(cluster_id).await?;
        for id in &cluster.nodes {
            let info = self.client.get_node(id).await?;
            if info.hostnames.manage.iter().any(|h| h == hostname) {
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    async fn ensure_devices(&self, devices: &[String], info: &NodeInfo) -> Result<(), ControllerError> {
        for device in devices {
            self.ensure_device(device, info).await?;
        }
        Ok(())
    }

    /// Register a raw device on a remote node unless it is already known.
    ///
    /// Returns whether a device was added.
    pub async fn ensure_device(&self, path: &str, info: &NodeInfo) -> Result<bool, ControllerError> {
        if info.has_device(path) {
            return Ok(false);
        }

        self.client
            .add_device(&DeviceAddRequest {
                name: path.to_string(),
                node: info.id.clone(),
                destroydata: false,
            })
            .await?;
        info!(node = %info.id, device = path, "Added remote device");
        Ok(true)
    }

    /// Write labels onto a deployment, skipping the update when nothing changes.
    ///
    /// A conflicting write is retried on a fresh copy of the deployment.
    async fn persist_labels(
        &self,
        mut deployment: Deployment,
        labels: &[(&str, &str)],
    ) -> Result<Deployment, ControllerError> {
        let namespace = deployment.namespace().unwrap_or_default();
        let name = deployment.name_any();
        let mut attempt = 1;

        loop {
            let current = deployment.labels();
            if labels
                .iter()
                .all(|(key, value)| current.get(*key).map(String::as_str) == Some(*value))
            {
                return Ok(deployment);
            }

            let target = deployment.labels_mut();
            for (key, value) in labels {
                target.insert((*key).to_string(), (*value).to_string());
            }
            match self.store.replace_deployment(&deployment).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict(message)) if attempt < LABEL_WRITE_ATTEMPTS => {
                    attempt += 1;
                    debug!(deployment = %name, attempt, "Label write conflicted: {message}");
                    deployment = self.store.get_deployment(&namespace, &name).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::default_cluster;
    use crate::orchestrator::objects;
    use crate::test_utils::{MockObjectStore, create_test_cluster, storage_node_with_devices};
    use topology_client::MockTopologyClient;

    struct Fixture {
        store: MockObjectStore,
        client: MockTopologyClient,
        ids: Arc<RemoteIdTable>,
        cluster: GlusterCluster,
    }

    impl Fixture {
        fn new(devices: &[usize]) -> Self {
            let mut raw = create_test_cluster("alpha", "storage", "1");
            raw.spec.nodes = devices.iter().map(|n| storage_node_with_devices(*n)).collect();
            let cluster = default_cluster(&raw).unwrap();

            let store = MockObjectStore::new();
            store.insert_deployment(objects::deployment(
                cluster.spec.heketi.as_ref().unwrap().node.as_ref().unwrap(),
            ));
            for node in &cluster.spec.nodes {
                store.insert_deployment(objects::deployment(node));
            }

            Self {
                store,
                client: MockTopologyClient::new("http://alpha-topology-manager.alpha:8080"),
                ids: Arc::new(RemoteIdTable::new()),
                cluster,
            }
        }

        fn sync(&self) -> TopologySync {
            TopologySync::new(
                Arc::new(self.client.clone()),
                Arc::new(self.store.clone()),
                Arc::clone(&self.ids),
                &self.cluster,
            )
            .unwrap()
        }
    }

    #[test]
    fn test_topology_url_and_auth() {
        let cluster = default_cluster(&create_test_cluster("alpha", "storage", "1")).unwrap();
        assert_eq!(topology_url(&cluster).unwrap(), "http://alpha-topology-manager.alpha:8080");
        let client = HeketiClientFactory.client_for(&cluster).unwrap();
        assert_eq!(client.base_url(), "http://alpha-topology-manager.alpha:8080");
    }

    #[tokio::test]
    async fn test_ensure_cluster_creates_once_and_labels_manager() {
        let fixture = Fixture::new(&[]);
        let mut sync = fixture.sync();

        let id = sync.ensure_cluster().await.unwrap();
        let again = sync.ensure_cluster().await.unwrap();

        assert_eq!(id, again);
        assert_eq!(fixture.client.create_cluster_calls(), 1);
        let manager = fixture.store.deployment("storage", "alpha-topology-manager").unwrap();
        assert_eq!(manager.labels()[CLUSTER_ID_LABEL], id);
        assert_eq!(fixture.store.deployment_replaces(), 1);
    }

    #[tokio::test]
    async fn test_ensure_cluster_replaces_unknown_id() {
        let fixture = Fixture::new(&[]);
        let mut manager = fixture.store.deployment("storage", "alpha-topology-manager").unwrap();
        manager
            .labels_mut()
            .insert(CLUSTER_ID_LABEL.to_string(), "vanished".to_string());
        fixture.store.insert_deployment(manager);

        let id = fixture.sync().ensure_cluster().await.unwrap();

        assert_ne!(id, "vanished");
        assert_eq!(fixture.client.create_cluster_calls(), 1);
    }

    #[tokio::test]
    async fn test_ensure_node_requires_cluster() {
        let fixture = Fixture::new(&[1]);
        let result = fixture.sync().ensure_node(&fixture.cluster.spec.nodes[0]).await;
        assert!(matches!(result, Err(ControllerError::Topology(TopologyError::InvalidRequest(_)))));
    }

    #[tokio::test]
    async fn test_ensure_node_twice_registers_once() {
        let fixture = Fixture::new(&[2]);
        let node = &fixture.cluster.spec.nodes[0];
        let mut sync = fixture.sync();
        sync.ensure_cluster().await.unwrap();

        let first = sync.ensure_node(node).await.unwrap();
        let second = sync.ensure_node(node).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(fixture.client.add_node_calls(), 1);
        assert_eq!(fixture.client.add_device_calls(), 2);

        let registered = &fixture.client.nodes()[0];
        assert_eq!(registered.hostnames.manage, vec!["alpha-0.alpha.storage.svc"]);
        assert_eq!(registered.zone, 1);

        let deployment = fixture.store.deployment("storage", "alpha-0").unwrap();
        assert_eq!(deployment.labels()[NODE_ID_LABEL], first.id);
    }

    #[tokio::test]
    async fn test_labels_survive_a_restart() {
        let fixture = Fixture::new(&[1]);
        let node = &fixture.cluster.spec.nodes[0];
        let mut sync = fixture.sync();
        sync.ensure_cluster().await.unwrap();
        sync.ensure_node(node).await.unwrap();

        // A new process starts with an empty table
        let restarted = TopologySync::new(
            Arc::new(fixture.client.clone()),
            Arc::new(fixture.store.clone()),
            Arc::new(RemoteIdTable::new()),
            &fixture.cluster,
        );
        let mut restarted = restarted.unwrap();
        restarted.ensure_cluster().await.unwrap();
        restarted.ensure_node(node).await.unwrap();

        assert_eq!(fixture.client.create_cluster_calls(), 1);
        assert_eq!(fixture.client.add_node_calls(), 1);
        assert_eq!(fixture.client.add_device_calls(), 1);
    }

    #[tokio::test]
    async fn test_new_device_is_added_once() {
        let fixture = Fixture::new(&[1]);
        let mut sync = fixture.sync();
        sync.ensure_cluster().await.unwrap();
        let info = sync.ensure_node(&fixture.cluster.spec.nodes[0]).await.unwrap();
        let refreshed = fixture.client.nodes()[0].clone();

        assert!(sync.ensure_device("/dev/gluster/alpha-0-9", &refreshed).await.unwrap());
        assert!(!sync.ensure_device("/dev/gluster/alpha-0-0", &refreshed).await.unwrap());
        assert_eq!(info.id, refreshed.id);
        assert_eq!(fixture.client.add_device_calls(), 2);
    }

    #[tokio::test]
    async fn test_forgotten_remote_node_is_registered_again() {
        let fixture = Fixture::new(&[1]);
        let node = &fixture.cluster.spec.nodes[0];
        let mut sync = fixture.sync();
        sync.ensure_cluster().await.unwrap();
        let first = sync.ensure_node(node).await.unwrap();

        fixture.client.forget_node(&first.id);
        let second = sync.ensure_node(node).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(fixture.client.add_node_calls(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_label_write_is_retried() {
        let fixture = Fixture::new(&[1]);
        let node = &fixture.cluster.spec.nodes[0];
        fixture.store.inject_deployment_conflicts("alpha-0", LABEL_WRITE_ATTEMPTS - 1);
        let mut sync = fixture.sync();
        sync.ensure_cluster().await.unwrap();

        let info = sync.ensure_node(node).await.unwrap();

        let deployment = fixture.store.deployment("storage", "alpha-0").unwrap();
        assert_eq!(deployment.labels()[NODE_ID_LABEL], info.id);
        assert_eq!(fixture.client.add_node_calls(), 1);
    }

    #[tokio::test]
    async fn test_node_id_is_kept_when_labels_cannot_be_written() {
        let fixture = Fixture::new(&[1]);
        let node = &fixture.cluster.spec.nodes[0];
        fixture.store.inject_deployment_conflicts("alpha-0", LABEL_WRITE_ATTEMPTS);
        let mut sync = fixture.sync();
        sync.ensure_cluster().await.unwrap();

        let failed = sync.ensure_node(node).await;
        assert!(matches!(failed, Err(ControllerError::Orchestration(StoreError::Conflict(_)))));
        let (_, id) = fixture.ids.node_ids(&node_key(node)).unwrap();

        let info = sync.ensure_node(node).await.unwrap();
        assert_eq!(info.id, id);
        assert_eq!(fixture.client.add_node_calls(), 1);
    }

    #[tokio::test]
    async fn test_node_registered_under_its_hostname_is_adopted() {
        let fixture = Fixture::new(&[1]);
        let node = &fixture.cluster.spec.nodes[0];
        let mut sync = fixture.sync();
        sync.ensure_cluster().await.unwrap();
        let first = sync.ensure_node(node).await.unwrap();

        // Restart after registration, before any label landed
        let mut bare = objects::deployment(node);
        bare.metadata.resource_version = fixture
            .store
            .deployment("storage", "alpha-0")
            .unwrap()
            .metadata
            .resource_version;
        fixture.store.insert_deployment(bare);
        let mut restarted = TopologySync::new(
            Arc::new(fixture.client.clone()),
            Arc::new(fixture.store.clone()),
            Arc::new(RemoteIdTable::new()),
            &fixture.cluster,
        )
        .unwrap();
        restarted.ensure_cluster().await.unwrap();

        let second = restarted.ensure_node(node).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(fixture.client.add_node_calls(), 1);
    }

    #[tokio::test]
    async fn test_topology_errors_propagate() {
        let fixture = Fixture::new(&[]);
        fixture.client.fail_with("manager unavailable");
        let result = fixture.sync().ensure_cluster().await;
        assert!(matches!(result, Err(ControllerError::Topology(_))));
    }
}
