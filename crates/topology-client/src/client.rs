//! Heketi API client
//!
//! Implements the heketi REST API client for topology operations.
//! Based on heketi's API structure: /clusters, /nodes, /devices and /queue.

use crate::common::HttpClient;
use crate::error::TopologyError;
use crate::models::*;
use crate::topology_trait::TopologyClientTrait;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

/// Heketi API client
#[derive(Debug, Clone)]
pub struct TopologyClient {
    http: HttpClient,
}

impl TopologyClient {
    /// Create a new heketi client
    ///
    /// # Arguments
    /// * `base_url` - heketi base URL (e.g., "http://heketi.storage:8080")
    /// * `user` - JWT issuer, normally "admin"
    /// * `key` - admin key; `None` when authentication is disabled
    pub fn new(base_url: String, user: String, key: Option<String>) -> Result<Self, TopologyError> {
        // Queue redirects are followed by hand so each hop is signed for its own path
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(Policy::none())
            .build()
            .map_err(TopologyError::Http)?;

        Ok(Self {
            http: HttpClient::new(client, base_url, user, key),
        })
    }

    /// Override the polling of asynchronous operations.
    #[must_use]
    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.http = self.http.with_polling(interval, timeout);
        self
    }
}

#[async_trait::async_trait]
impl TopologyClientTrait for TopologyClient {
    fn base_url(&self) -> &str {
        self.http.base_url()
    }

    async fn hello(&self) -> Result<(), TopologyError> {
        debug!("Checking topology manager at {}", self.http.base_url());
        // /hello answers plain text, so only the status matters
        match self.http.get::<serde_json::Value>("/hello").await {
            Ok(_) | Err(TopologyError::Serialization(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_clusters(&self) -> Result<Vec<String>, TopologyError> {
        let list: ClusterList = self.http.get("/clusters").await?;
        Ok(list.clusters)
    }

    async fn create_cluster(&self, request: &ClusterCreateRequest) -> Result<ClusterInfo, TopologyError> {
        let cluster: ClusterInfo = self.http.post("/clusters", request).await?;
        info!("Created topology cluster {}", cluster.id);
        Ok(cluster)
    }

    async fn get_cluster(&self, id: &str) -> Result<ClusterInfo, TopologyError> {
        if id.is_empty() {
            return Err(TopologyError::InvalidRequest("cluster id is empty".to_string()));
        }
        self.http.get(&format!("/clusters/{id}")).await
    }

    async fn add_node(&self, request: &NodeAddRequest) -> Result<NodeInfo, TopologyError> {
        if request.cluster.is_empty() {
            return Err(TopologyError::InvalidRequest("node add without cluster id".to_string()));
        }
        let location = self.http.post_async("/nodes", request).await?.ok_or_else(|| {
            TopologyError::Api("node add finished without a node location".to_string())
        })?;
        let node: NodeInfo = self.http.get(&location).await?;
        info!("Added topology node {} to cluster {}", node.id, node.cluster);
        Ok(node)
    }

    async fn get_node(&self, id: &str) -> Result<NodeInfo, TopologyError> {
        if id.is_empty() {
            return Err(TopologyError::InvalidRequest("node id is empty".to_string()));
        }
        self.http.get(&format!("/nodes/{id}")).await
    }

    async fn add_device(&self, request: &DeviceAddRequest) -> Result<(), TopologyError> {
        self.http.post_async("/devices", request).await?;
        info!("Added device {} to topology node {}", request.name, request.node);
        Ok(())
    }
}
