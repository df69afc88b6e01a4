//! Heketi API models
//!
//! These models match the JSON bodies of heketi's REST API.
//! See: heketi/pkg/glusterfs/api/types.go

use serde::{Deserialize, Serialize};

/// Request body for creating a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCreateRequest {
    /// Cluster may host file volumes
    pub file: bool,
    /// Cluster may host block volumes
    pub block: bool,
}

/// Cluster model matching heketi ClusterInfoResponse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub file: bool,
    #[serde(default)]
    pub block: bool,
}

/// Response of `GET /clusters`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterList {
    #[serde(default)]
    pub clusters: Vec<String>,
}

/// Management and storage addresses of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hostnames {
    #[serde(default)]
    pub manage: Vec<String>,
    #[serde(default)]
    pub storage: Vec<String>,
}

/// Request body for adding a node to a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddRequest {
    pub zone: i32,
    pub hostnames: Hostnames,
    /// Owning cluster ID
    pub cluster: String,
}

/// Node model matching heketi NodeInfoResponse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub cluster: String,
    #[serde(default)]
    pub zone: i32,
    #[serde(default)]
    pub hostnames: Hostnames,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

impl NodeInfo {
    /// Whether a device with this path is already registered on the node.
    #[must_use]
    pub fn has_device(&self, name: &str) -> bool {
        self.devices.iter().any(|d| d.name == name)
    }
}

/// Device model matching heketi DeviceInfoResponse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    /// Raw device path, e.g. `/dev/gluster/node-0-0`
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub storage: StorageSize,
}

/// Device capacity in KiB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSize {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub free: u64,
    #[serde(default)]
    pub used: u64,
}

/// Request body for adding a raw device to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddRequest {
    pub name: String,
    /// Owning node ID
    pub node: String,
    #[serde(default)]
    pub destroydata: bool,
}

/// JWT claims heketi expects on every request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
    /// Hex SHA-256 of `"<METHOD>&<path>"`
    pub qsh: String,
}
