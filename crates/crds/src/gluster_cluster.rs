//! GlusterCluster CRD
//!
//! Declares a storage cluster: a set of storage nodes with their raw block
//! devices, plus the topology manager (heketi) that tracks them.

use crate::heketi_config::HeketiConfig;
use crate::schema::preserve_unknown_fields;
use k8s_openapi::api::core::v1::{PersistentVolumeSpec, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gluster.org",
    version = "v1alpha1",
    kind = "GlusterCluster",
    namespaced,
    status = "GlusterClusterStatus",
    shortname = "gcluster"
)]
#[serde(rename_all = "camelCase")]
pub struct GlusterClusterSpec {
    /// Seconds to wait for a node deployment to roll out (default 300)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_timeout: Option<i32>,

    /// Delete every dependent object when the cluster is deleted
    #[serde(default)]
    pub cascade: bool,

    /// Wipe raw devices before handing them to the topology manager
    #[serde(default)]
    pub wipe: bool,

    /// Storage nodes, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,

    /// Topology manager deployment and configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heketi: Option<HeketiSpec>,

    /// File storage settings
    #[serde(default, rename = "glusterfs", skip_serializing_if = "Option::is_none")]
    pub glusterfs: Option<GlusterfsSpec>,

    /// Block storage settings
    #[serde(default, rename = "glusterblock", skip_serializing_if = "Option::is_none")]
    pub glusterblock: Option<GlusterBlockSpec>,
}

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ServerType {
    /// Gluster storage server
    #[serde(rename = "gluster", alias = "storage")]
    Storage,

    /// Heketi topology manager
    #[serde(rename = "heketi", alias = "topology-manager")]
    TopologyManager,
}

impl ServerType {
    /// Label value identifying the node role within its cluster.
    #[must_use]
    pub fn role_label(self) -> &'static str {
        match self {
            ServerType::Storage => "storage-node",
            ServerType::TopologyManager => "topology-manager-node",
        }
    }
}

/// One pod of the storage cluster.
///
/// Name, namespace, labels, owner references and the volume wiring of the
/// pod template are derived by the controller on every reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Node identity
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub metadata: ObjectMeta,

    /// Rollout timeout in seconds (inherits the cluster pod timeout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i32>,

    /// Node role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_type: Option<ServerType>,

    /// Node IP address
    #[serde(default, rename = "ipAddress", skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    /// Failure zone reported to the topology manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<i32>,

    /// Raw block devices served by this node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<NodeVolume>,

    /// Volume holding the gluster daemon state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_volume: Option<NodeVolume>,

    /// Pod template
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub spec: PodSpec,
}

impl Node {
    /// Effective node name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Effective node namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Whether this node serves storage.
    #[must_use]
    pub fn is_storage(&self) -> bool {
        self.server_type == Some(ServerType::Storage)
    }
}

/// A volume attached to a node: its state volume or one of its devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeVolume {
    /// Volume identity
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub metadata: ObjectMeta,

    /// Create the storage class and persistent volume, not only the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision: Option<bool>,

    /// Persistent volume specification
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub spec: PersistentVolumeSpec,
}

impl NodeVolume {
    /// Effective volume name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Name of the claim binding this volume.
    #[must_use]
    pub fn claim_name(&self) -> String {
        format!("{}-claim", self.name())
    }

    /// Whether the controller provisions the underlying volume.
    #[must_use]
    pub fn provisioned(&self) -> bool {
        self.provision.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeketiSpec {
    /// Deploy heketi inside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Secret holding the admin key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_secret: Option<String>,

    /// heketi.json contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<HeketiConfig>,

    /// Heketi pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<Node>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlusterfsSpec {
    /// Run gluster inside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner: Option<VolumeProvisioner>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlusterBlockSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner: Option<VolumeProvisioner>,
}

/// Dynamic provisioner for file or block volumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeProvisioner {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_storage_class: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlusterClusterStatus {
    /// Every dependent object exists and storage nodes are registered
    #[serde(default)]
    pub deployed: bool,
}
