//! Mock TopologyClient for unit testing
//!
//! This module provides a mock implementation of TopologyClientTrait that can be used
//! in unit tests without requiring a running heketi instance.

use crate::error::TopologyError;
use crate::models::*;
use crate::topology_trait::TopologyClientTrait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Mock TopologyClient for testing
///
/// Stores clusters and nodes in memory and mirrors heketi's conflict rules:
/// a hostname can only be registered once and a device path only once per node.
#[derive(Debug, Clone)]
pub struct MockTopologyClient {
    base_url: String,
    clusters: Arc<Mutex<HashMap<String, ClusterInfo>>>,
    nodes: Arc<Mutex<HashMap<String, NodeInfo>>>,
    // Counter for generating IDs
    next_id: Arc<Mutex<u64>>,
    // Call counters
    create_cluster_calls: Arc<Mutex<usize>>,
    add_node_calls: Arc<Mutex<usize>>,
    add_device_calls: Arc<Mutex<usize>>,
    // When set, every call fails with this message
    failure: Arc<Mutex<Option<String>>>,
}

impl MockTopologyClient {
    /// Create a new mock client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            clusters: Arc::new(Mutex::new(HashMap::new())),
            nodes: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
            create_cluster_calls: Arc::new(Mutex::new(0)),
            add_node_calls: Arc::new(Mutex::new(0)),
            add_device_calls: Arc::new(Mutex::new(0)),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Make every subsequent call fail (for test setup)
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(message.into());
    }

    /// Stop injecting failures
    pub fn clear_failure(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Number of clusters created through the API
    pub fn create_cluster_calls(&self) -> usize {
        *self.create_cluster_calls.lock().unwrap()
    }

    /// Number of node add requests received, successful or not
    pub fn add_node_calls(&self) -> usize {
        *self.add_node_calls.lock().unwrap()
    }

    /// Number of device add requests received, successful or not
    pub fn add_device_calls(&self) -> usize {
        *self.add_device_calls.lock().unwrap()
    }

    /// All clusters currently known
    pub fn clusters(&self) -> Vec<ClusterInfo> {
        self.clusters.lock().unwrap().values().cloned().collect()
    }

    /// All nodes currently known
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.nodes.lock().unwrap().values().cloned().collect()
    }

    /// Remove a node behind the controller's back (for test setup)
    pub fn forget_node(&self, id: &str) {
        self.nodes.lock().unwrap().remove(id);
        for cluster in self.clusters.lock().unwrap().values_mut() {
            cluster.nodes.retain(|n| n != id);
        }
    }

    /// Generate next ID
    fn next_id(&self, kind: &str) -> String {
        let mut id = self.next_id.lock().unwrap();
        let current = *id;
        *id += 1;
        format!("{kind}-{current}")
    }

    fn check_failure(&self) -> Result<(), TopologyError> {
        match self.failure.lock().unwrap().as_ref() {
            Some(message) => Err(TopologyError::Api(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl TopologyClientTrait for MockTopologyClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn hello(&self) -> Result<(), TopologyError> {
        self.check_failure()
    }

    async fn list_clusters(&self) -> Result<Vec<String>, TopologyError> {
        self.check_failure()?;
        Ok(self.clusters.lock().unwrap().keys().cloned().collect())
    }

    async fn create_cluster(&self, request: &ClusterCreateRequest) -> Result<ClusterInfo, TopologyError> {
        *self.create_cluster_calls.lock().unwrap() += 1;
        self.check_failure()?;

        let cluster = ClusterInfo {
            id: self.next_id("cluster"),
            nodes: vec![],
            volumes: vec![],
            file: request.file,
            block: request.block,
        };
        self.clusters
            .lock()
            .unwrap()
            .insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn get_cluster(&self, id: &str) -> Result<ClusterInfo, TopologyError> {
        self.check_failure()?;
        self.clusters
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TopologyError::NotFound(format!("Cluster {id} not found")))
    }

    async fn add_node(&self, request: &NodeAddRequest) -> Result<NodeInfo, TopologyError> {
        *self.add_node_calls.lock().unwrap() += 1;
        self.check_failure()?;

        if !self.clusters.lock().unwrap().contains_key(&request.cluster) {
            return Err(TopologyError::NotFound(format!(
                "Cluster {} not found",
                request.cluster
            )));
        }

        let mut nodes = self.nodes.lock().unwrap();
        let in_use = nodes.values().any(|n| {
            n.hostnames
                .manage
                .iter()
                .any(|h| request.hostnames.manage.contains(h))
        });
        if in_use {
            return Err(TopologyError::Api(format!(
                "Hostname {:?} already used by another node",
                request.hostnames.manage
            )));
        }

        let node = NodeInfo {
            id: self.next_id("node"),
            cluster: request.cluster.clone(),
            zone: request.zone,
            hostnames: request.hostnames.clone(),
            state: "online".to_string(),
            devices: vec![],
        };
        nodes.insert(node.id.clone(), node.clone());
        drop(nodes);

        if let Some(cluster) = self.clusters.lock().unwrap().get_mut(&request.cluster) {
            cluster.nodes.push(node.id.clone());
        }
        Ok(node)
    }

    async fn get_node(&self, id: &str) -> Result<NodeInfo, TopologyError> {
        self.check_failure()?;
        self.nodes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TopologyError::NotFound(format!("Node {id} not found")))
    }

    async fn add_device(&self, request: &DeviceAddRequest) -> Result<(), TopologyError> {
        *self.add_device_calls.lock().unwrap() += 1;
        self.check_failure()?;

        let device_id = self.next_id("device");
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(&request.node)
            .ok_or_else(|| TopologyError::NotFound(format!("Node {} not found", request.node)))?;
        if node.has_device(&request.name) {
            return Err(TopologyError::Api(format!(
                "Device {} already used",
                request.name
            )));
        }
        node.devices.push(DeviceInfo {
            id: device_id,
            name: request.name.clone(),
            state: "online".to_string(),
            storage: StorageSize::default(),
        });
        Ok(())
    }
}
