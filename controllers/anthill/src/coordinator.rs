//! Reconcile coordinator.
//!
//! Filters work items, then runs the converge sequence for a cluster under
//! the process-wide [`ReconcileLock`]:
//!
//! 1. default the old and new specs
//! 2. create the headless service
//! 3. bring up the topology manager and storage nodes (new clusters), or
//!    update, add and remove storage nodes by position (changed clusters)
//! 4. register the cluster, nodes and devices with the topology manager
//! 5. mark the cluster deployed and publish a `Synced` event
//!
//! Deleted clusters with `cascade` set are torn down explicitly.

use crate::backoff::ExponentialBackoff;
use crate::defaults::default_cluster;
use crate::diff::{NodeChange, diff_nodes};
use crate::error::{ControllerError, StoreError};
use crate::events::{EventPublisher, SYNCED_MESSAGE, actions, reasons};
use crate::orchestrator::Orchestrator;
use crate::queue::{WorkItem, WorkQueue};
use crate::store::ObjectStore;
use crate::topology::{RemoteIdTable, TopologyClientFactory, TopologySync, node_key};
use crate::watcher::ClusterCache;
use crds::{GlusterCluster, Node};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const STATUS_BASE_DELAY: Duration = Duration::from_millis(10);
const STATUS_MAX_DELAY: Duration = Duration::from_secs(1);

/// Serializes every mutating reconciliation in the process.
///
/// Workers run in parallel up to the point of filtering; past it at most one
/// reconciliation body executes at a time, whatever the cluster.
#[derive(Debug, Default)]
pub struct ReconcileLock(Mutex<()>);

impl ReconcileLock {
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

/// Ordering of two resource versions, when both are etcd revisions.
fn is_newer(cached: Option<&str>, delivered: Option<&str>) -> bool {
    let parse = |version: Option<&str>| version.and_then(|v| v.parse::<u64>().ok());
    match (parse(cached), parse(delivered)) {
        (Some(cached), Some(delivered)) => cached > delivered,
        _ => false,
    }
}

fn cluster_key(cluster: &GlusterCluster) -> String {
    format!("{}/{}", cluster.namespace().unwrap_or_default(), cluster.name_any())
}

fn storage_native(cluster: &GlusterCluster) -> bool {
    cluster
        .spec
        .glusterfs
        .as_ref()
        .and_then(|g| g.native)
        .unwrap_or(false)
}

pub struct Coordinator {
    cache: Arc<dyn ClusterCache>,
    store: Arc<dyn ObjectStore>,
    orchestrator: Orchestrator,
    topology: Arc<dyn TopologyClientFactory>,
    ids: Arc<RemoteIdTable>,
    events: Arc<dyn EventPublisher>,
    lock: ReconcileLock,
    status_retries: u32,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("orchestrator", &self.orchestrator)
            .field("status_retries", &self.status_retries)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(
        cache: Arc<dyn ClusterCache>,
        store: Arc<dyn ObjectStore>,
        orchestrator: Orchestrator,
        topology: Arc<dyn TopologyClientFactory>,
        events: Arc<dyn EventPublisher>,
        status_retries: u32,
    ) -> Self {
        Self {
            cache,
            store,
            orchestrator,
            topology,
            ids: Arc::new(RemoteIdTable::new()),
            events,
            lock: ReconcileLock::default(),
            status_retries,
        }
    }

    /// Pull one item from the queue and process it.
    ///
    /// Returns `false` once the queue is shut down.
    pub async fn process_next_item(&self, queue: &Arc<WorkQueue>) -> bool {
        let Some(item) = queue.get().await else {
            return false;
        };
        let key = item.key();

        match self.process(&item).await {
            Ok(()) => {
                queue.forget(&item);
                info!(cluster = %key, "Successfully processed item");
            }
            Err(e) if e.is_drop() => {
                queue.forget(&item);
                debug!(cluster = %key, reason = %e, "Dropped item");
            }
            Err(e) => {
                let requeues = queue.num_requeues(&item);
                error!(cluster = %key, error = %e, requeues, "Processing failed, re-queueing");
                queue.add_rate_limited(item.clone());
            }
        }

        queue.done(&item);
        if !queue.is_empty() {
            debug!(waiting = queue.len(), "Items waiting");
        }
        true
    }

    /// Filter and process one work item.
    pub async fn process(&self, item: &WorkItem) -> Result<(), ControllerError> {
        self.check(item)?;

        match (item.old(), item.new()) {
            (old, Some(new)) => self.sync(old, new).await,
            (Some(old), None) => self.delete(old).await,
            (None, None) => Err(ControllerError::MalformedEvent(item.key())),
        }
    }

    /// Reject items that must not reach the converge sequence.
    fn check(&self, item: &WorkItem) -> Result<(), ControllerError> {
        for cluster in item.old().into_iter().chain(item.new()) {
            if cluster.metadata.name.as_deref().unwrap_or_default().is_empty()
                || cluster.metadata.namespace.as_deref().unwrap_or_default().is_empty()
            {
                return Err(ControllerError::MalformedEvent(format!(
                    "{} payload without name or namespace",
                    item.key()
                )));
            }
        }

        let Some(new) = item.new() else {
            return Ok(());
        };

        if let Some(old) = item.old() {
            if old.resource_version() == new.resource_version() {
                return Err(ControllerError::NoopEvent(format!(
                    "{} resync at version {}",
                    item.key(),
                    new.resource_version().unwrap_or_default()
                )));
            }
        }

        let namespace = new.namespace().unwrap_or_default();
        let Some(cached) = self.cache.get(&namespace, &new.name_any()) else {
            return Err(ControllerError::StaleEvent(format!("{} is no longer cached", item.key())));
        };
        if is_newer(cached.meta().resource_version.as_deref(), new.meta().resource_version.as_deref()) {
            return Err(ControllerError::StaleEvent(format!(
                "{} cached at {}, event carries {}",
                item.key(),
                cached.resource_version().unwrap_or_default(),
                new.resource_version().unwrap_or_default()
            )));
        }

        if item.old().is_some_and(|old| old.spec == new.spec) {
            info!(cluster = %item.key(), "Spec unchanged, ignoring");
            return Err(ControllerError::NoopEvent(format!("{} status-only change", item.key())));
        }

        Ok(())
    }

    async fn sync(&self, old: Option<&GlusterCluster>, new: &GlusterCluster) -> Result<(), ControllerError> {
        let _guard = self.lock.acquire().await;
        let key = cluster_key(new);
        info!(cluster = %key, version = %new.resource_version().unwrap_or_default(), "Processing GlusterCluster");

        let result = self.reconcile(old, new).await;
        let reference = new.object_ref(&());
        match &result {
            Ok(()) => {
                info!(cluster = %key, "Updated GlusterCluster");
                self.events
                    .publish(
                        &reference,
                        EventType::Normal,
                        reasons::SYNCED,
                        actions::RECONCILE,
                        Some(SYNCED_MESSAGE.to_string()),
                    )
                    .await;
            }
            Err(e) => {
                self.events
                    .publish(
                        &reference,
                        EventType::Warning,
                        reasons::SYNC_FAILED,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
            }
        }
        result
    }

    async fn reconcile(&self, old: Option<&GlusterCluster>, new: &GlusterCluster) -> Result<(), ControllerError> {
        let old = old.map(default_cluster).transpose()?;
        let desired = default_cluster(new)?;

        self.converge(old.as_ref(), &desired).await?;
        self.mark_deployed(new).await
    }

    async fn converge(&self, old: Option<&GlusterCluster>, new: &GlusterCluster) -> Result<(), ControllerError> {
        let wipe = new.spec.wipe;
        let native = storage_native(new);
        let key = cluster_key(new);

        self.orchestrator.create_service(new).await?;

        let mut tasks = JoinSet::new();
        let mut added: Vec<&Node> = Vec::new();
        let mut changed: Vec<&Node> = Vec::new();

        match old {
            None => {
                let heketi = new
                    .spec
                    .heketi
                    .clone()
                    .ok_or_else(|| ControllerError::Defaulting("topology manager spec missing".to_string()))?;
                let orchestrator = self.orchestrator.clone();
                tasks.spawn(async move {
                    orchestrator.create_topology_config(&heketi).await?;
                    match &heketi.node {
                        Some(node) => orchestrator.deploy_node(node, wipe).await,
                        None => Err(ControllerError::Defaulting("topology manager node missing".to_string())),
                    }
                });
                added.extend(new.spec.nodes.iter());
            }
            Some(old) => {
                for change in diff_nodes(&old.spec.nodes, &new.spec.nodes) {
                    match change {
                        // Storage nodes only have deployments when run natively
                        NodeChange::Changed { old, new, .. } if native => {
                            self.orchestrator.update_node(old, new, wipe).await?;
                            changed.push(new);
                        }
                        NodeChange::Changed { new, .. } => {
                            debug!(cluster = %key, node = new.name(), "Storage not native, skipping node update");
                        }
                        NodeChange::Added { node, .. } => added.push(node),
                        NodeChange::Removed { node, .. } => {
                            self.orchestrator.remove_node(node).await?;
                            warn!(cluster = %key, node = node.name(), "Node removed; its topology manager entry is kept");
                        }
                    }
                }
            }
        }

        if native {
            for node in &added {
                let orchestrator = self.orchestrator.clone();
                let node = (*node).clone();
                tasks.spawn(async move { orchestrator.deploy_node(&node, wipe).await });
            }
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| ControllerError::Orchestration(StoreError::Other(format!("node task failed: {e}"))))
                .and_then(|result| result);
            if let Err(e) = result {
                error!(cluster = %key, error = %e, "Node bring-up failed");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(cluster = %key, "Syncing topology");
        let client = self.topology.client_for(new)?;
        let mut topology = TopologySync::new(client, Arc::clone(&self.store), Arc::clone(&self.ids), new)?;
        topology.ensure_cluster().await?;

        if native {
            for node in added.iter().chain(&changed).filter(|n| n.is_storage()) {
                topology.ensure_node(node).await?;
            }
        }
        Ok(())
    }

    /// Set `status.deployed`, retrying on conflicting writes.
    async fn mark_deployed(&self, raw: &GlusterCluster) -> Result<(), ControllerError> {
        if raw.status.as_ref().is_some_and(|s| s.deployed) {
            return Ok(());
        }

        let namespace = raw.namespace().unwrap_or_default();
        let name = raw.name_any();
        let mut backoff = ExponentialBackoff::new(STATUS_BASE_DELAY, STATUS_MAX_DELAY);
        let mut cluster = raw.clone();
        let mut attempts = 0;

        loop {
            cluster.status.get_or_insert_with(Default::default).deployed = true;
            match self.store.update_cluster_status(&cluster).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict(message)) if attempts < self.status_retries => {
                    attempts += 1;
                    debug!(cluster = %name, attempts, "Status update conflicted: {message}");
                    tokio::time::sleep(backoff.next_backoff()).await;

                    cluster = self.store.get_cluster(&namespace, &name).await?;
                    if cluster.status.as_ref().is_some_and(|s| s.deployed) {
                        return Ok(());
                    }
                }
                Err(StoreError::Conflict(message)) => return Err(ControllerError::StatusConflict(message)),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete(&self, old: &GlusterCluster) -> Result<(), ControllerError> {
        let key = cluster_key(old);
        if !old.spec.cascade {
            info!(cluster = %key, "Removed GlusterCluster without cascade");
            return Ok(());
        }

        let _guard = self.lock.acquire().await;
        info!(cluster = %key, "Tearing down GlusterCluster");
        let reference = old.object_ref(&());

        let result = match default_cluster(old) {
            Ok(cluster) => self.orchestrator.teardown(&cluster).await.map(|()| cluster),
            Err(e) => Err(e),
        };
        match result {
            Ok(cluster) => {
                let nodes: Vec<String> = cluster.spec.nodes.iter().map(node_key).collect();
                self.ids.forget(&key, &nodes);
                info!(cluster = %key, "Removed GlusterCluster");
                self.events
                    .publish(&reference, EventType::Normal, reasons::DELETED, actions::TEARDOWN, None)
                    .await;
                Ok(())
            }
            Err(e) => {
                self.events
                    .publish(
                        &reference,
                        EventType::Warning,
                        reasons::SYNC_FAILED,
                        actions::TEARDOWN,
                        Some(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }
}
