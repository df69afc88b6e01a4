//! heketi.json document
//!
//! Field names follow heketi's own configuration file, because the document
//! is serialized verbatim into the topology manager's config map.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HeketiConfig {
    /// Listen port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_auth: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<JwtConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_db_to_kube_secret: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glusterfs: Option<GlusterFsConfig>,
}

impl HeketiConfig {
    /// Admin key used to sign API requests.
    #[must_use]
    pub fn admin_key(&self) -> Option<&str> {
        self.jwt.as_ref()?.admin.as_ref()?.key.as_deref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JwtConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<JwtIssuer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<JwtIssuer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JwtIssuer {
    /// Shared HMAC secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GlusterFsConfig {
    /// Database file path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,

    /// `kubernetes`, `ssh` or `mock`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sshexec: Option<SshExecConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeexec: Option<KubeExecConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loglevel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brick_max_size_gb: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brick_min_size_gb: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bricks_per_volume: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_create_block_hosting_volume: Option<bool>,

    /// Size in GB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hosting_volume_size: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_stale_operations: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KubeExecConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fstab: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_limit: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebalance_on_expansion: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gluster_daemonset: Option<bool>,

    /// Address pods by name instead of by label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_pod_names: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SshExecConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fstab: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}
