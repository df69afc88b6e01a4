//! TopologyClient trait for mocking
//!
//! This trait abstracts the TopologyClient to enable mocking in unit tests.
//! The concrete TopologyClient implements this trait, and tests can use mock implementations.

use crate::error::TopologyError;
use crate::models::*;

/// Trait for topology manager operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait TopologyClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Check the topology manager is reachable
    async fn hello(&self) -> Result<(), TopologyError>;

    // Cluster Operations
    async fn list_clusters(&self) -> Result<Vec<String>, TopologyError>;
    async fn create_cluster(&self, request: &ClusterCreateRequest) -> Result<ClusterInfo, TopologyError>;
    async fn get_cluster(&self, id: &str) -> Result<ClusterInfo, TopologyError>;

    // Node Operations
    async fn add_node(&self, request: &NodeAddRequest) -> Result<NodeInfo, TopologyError>;
    async fn get_node(&self, id: &str) -> Result<NodeInfo, TopologyError>;

    // Device Operations
    async fn add_device(&self, request: &DeviceAddRequest) -> Result<(), TopologyError>;
}
