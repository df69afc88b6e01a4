//! Defaulting and derivation.
//!
//! [`default_cluster`] turns a raw `GlusterCluster` into its effective
//! desired state: unset fields are filled from [`templates`] and every name,
//! label, owner reference and piece of volume wiring is recomputed from the
//! cluster name, node positions and volumes. The input is never modified and
//! nothing is written back to the API server.

pub mod merge;
pub mod templates;

use crate::error::ControllerError;
use crds::{GlusterCluster, HeketiSpec, Node, NodeVolume, ServerType};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, HostPathVolumeSource, PersistentVolumeClaimVolumeSource,
    PersistentVolumeSpec, SecretVolumeSource, Volume, VolumeDevice,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use merge::Merge;
use std::collections::BTreeMap;
use templates::DEVICE_DIR;
use tracing::debug;

/// Label grouping every object belonging to one cluster component.
pub const GROUP_LABEL: &str = "anthill-group";
/// Label carrying a node's own name; storage pods read it as their node name.
pub const NAME_LABEL: &str = "name";
/// Label carrying the stable DNS name a storage node registers under.
pub const STORAGE_HOST_LABEL: &str = "glusterfs-node";

const DEVICES_ENV: &str = "DEVICES";
const DB_SECRET_ENV: &str = "HEKETI_KUBE_DB_SECRET_NAME";

/// Compute the effective desired state of `raw`.
///
/// # Errors
///
/// Returns [`ControllerError::Defaulting`] when the cluster has no identity
/// yet or when a node's pod template cannot be completed.
pub fn default_cluster(raw: &GlusterCluster) -> Result<GlusterCluster, ControllerError> {
    let name = raw
        .metadata
        .name
        .clone()
        .ok_or_else(|| ControllerError::Defaulting("cluster has no name".to_string()))?;
    let namespace = raw
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| ControllerError::Defaulting(format!("cluster {name} has no namespace")))?;
    let owner = raw
        .controller_owner_ref(&())
        .ok_or_else(|| ControllerError::Defaulting(format!("cluster {name} has no uid")))?;

    debug!(cluster = %name, namespace = %namespace, "Defaulting cluster");

    let mut cluster = raw.clone();
    cluster.spec.merge_from(&templates::cluster_defaults());
    cluster.labels_mut().extend(cluster_labels(&name));

    let context = ClusterContext {
        pod_timeout: cluster.spec.pod_timeout.unwrap_or_default(),
        name,
        namespace,
        owner,
    };

    let heketi = cluster.spec.heketi.get_or_insert_with(HeketiSpec::default);
    derive_topology_manager(&context, heketi)?;

    for (index, node) in cluster.spec.nodes.iter_mut().enumerate() {
        derive_storage_node(&context, node, index)?;
    }

    Ok(cluster)
}

/// Cluster identity shared by every derived node and volume.
struct ClusterContext {
    name: String,
    namespace: String,
    owner: OwnerReference,
    pod_timeout: i32,
}

pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (GROUP_LABEL.to_string(), cluster.to_string()),
        (cluster.to_string(), "cluster".to_string()),
    ])
}

/// Labels shared by every node pod of `cluster`; the headless service selects on them.
pub fn node_group_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(GROUP_LABEL.to_string(), format!("{cluster}-node"))])
}

/// Raw device path of a data volume inside the storage pod.
pub fn device_path(volume: &NodeVolume) -> String {
    format!("{DEVICE_DIR}{}", volume.name())
}

/// Host kernel modules exposed read-only to a storage node.
///
/// Only meaningful for a derived storage node: it shares the labels and
/// owner of the node's state volume.
pub fn kernel_modules_volume(node: &Node) -> NodeVolume {
    let state = node.state_volume.clone().unwrap_or_default();

    let mut volume = NodeVolume {
        provision: Some(true),
        spec: PersistentVolumeSpec {
            capacity: Some(templates::storage_capacity("1Gi")),
            access_modes: Some(vec!["ReadOnlyMany".to_string()]),
            host_path: Some(HostPathVolumeSource {
                path: "/usr/lib/modules".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    volume.metadata.name = Some(format!("{}-kernel-modules", node.name()));
    volume.metadata.namespace = Some(node.namespace().to_string());
    volume.metadata.labels = state.metadata.labels;
    volume.metadata.owner_references = state.metadata.owner_references;
    volume
}

fn derive_topology_manager(context: &ClusterContext, heketi: &mut HeketiSpec) -> Result<(), ControllerError> {
    let node = heketi
        .node
        .get_or_insert_with(templates::heketi_node_defaults);

    derive_identity(
        context,
        node,
        format!("{}-topology-manager", context.name),
        ServerType::TopologyManager,
    );
    let name = node.name().to_string();

    node.spec.service_account_name = Some(format!("{name}-service-account"));

    let db_secret = format!("{name}-db-secret");
    let volumes = node.spec.volumes.get_or_insert_with(Vec::new);
    upsert_volume(
        volumes,
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: format!("{name}-config"),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    upsert_volume(
        volumes,
        Volume {
            name: "backupdb".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(db_secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    let container = node.spec.containers.first_mut().ok_or_else(|| {
        ControllerError::Defaulting(format!("topology manager node {name} has no containers"))
    })?;
    set_env(container, DB_SECRET_ENV, db_secret);

    Ok(())
}

fn derive_storage_node(context: &ClusterContext, node: &mut Node, index: usize) -> Result<(), ControllerError> {
    node.merge_from(&templates::gluster_node_defaults());
    derive_identity(
        context,
        node,
        format!("{}-{index}", context.name),
        ServerType::Storage,
    );
    let name = node.name().to_string();
    let namespace = node.namespace().to_string();
    let owners = node.metadata.owner_references.clone();

    node.metadata.labels.get_or_insert_with(BTreeMap::new).insert(
        STORAGE_HOST_LABEL.to_string(),
        format!("{name}.{}.{}.svc", context.name, context.namespace),
    );

    let state = node.state_volume.get_or_insert_with(NodeVolume::default);
    if state.name().is_empty() {
        state.metadata.name = Some(format!("{name}-state"));
    }
    state.metadata.namespace = Some(namespace.clone());
    state.metadata.owner_references.clone_from(&owners);
    state.metadata.labels = Some(BTreeMap::from([
        (GROUP_LABEL.to_string(), format!("{}-{name}-volume", context.name)),
        (context.name.clone(), format!("{name}-volume")),
    ]));
    let state_claim = state.claim_name();

    let volumes = node.spec.volumes.get_or_insert_with(Vec::new);
    upsert_volume(volumes, claim_volume("gluster-state", state_claim));
    upsert_volume(
        volumes,
        claim_volume("kernel-modules", format!("{name}-kernel-modules-claim")),
    );

    if !node.spec.containers.iter().any(|c| c.name == "glusterfs") {
        node.spec.containers.insert(0, templates::gluster_container_defaults());
    }
    let init_containers = node.spec.init_containers.get_or_insert_with(Vec::new);
    if !init_containers.iter().any(|c| c.name == "blkdevmapper") {
        init_containers.insert(0, templates::block_mapper_container_defaults());
    }

    let volume_defaults = templates::node_volume_defaults();
    let mut device_paths = Vec::with_capacity(node.devices.len());
    for (index, volume) in node.devices.iter_mut().enumerate() {
        volume.merge_from(&volume_defaults);
        if volume.name().is_empty() {
            volume.metadata.name = Some(format!("{name}-{index}"));
        }
        if volume.spec.storage_class_name.as_deref().unwrap_or_default().is_empty() {
            volume.spec.storage_class_name = Some(format!("{name}-volumes"));
        }
        volume.metadata.namespace = Some(namespace.clone());
        volume.metadata.owner_references.clone_from(&owners);
        volume.metadata.labels = Some(BTreeMap::from([
            (GROUP_LABEL.to_string(), format!("{}-{name}-device", context.name)),
            (context.name.clone(), format!("{name}-device")),
        ]));
        device_paths.push((volume.name().to_string(), volume.claim_name(), device_path(volume)));
    }

    let volumes = node.spec.volumes.get_or_insert_with(Vec::new);
    for (volume, claim, _) in &device_paths {
        upsert_volume(volumes, claim_volume(volume, claim.clone()));
    }

    let devices: Vec<VolumeDevice> = device_paths
        .iter()
        .map(|(volume, _, path)| VolumeDevice {
            name: volume.clone(),
            device_path: path.clone(),
        })
        .collect();

    let storage = node.spec.containers.first_mut().ok_or_else(|| {
        ControllerError::Defaulting(format!("storage node {name} has no containers"))
    })?;
    attach_devices(storage, &devices);

    if let Some(mapper) = node.spec.init_containers.as_mut().and_then(|c| c.first_mut()) {
        attach_devices(mapper, &devices);
        let staged: Vec<&str> = device_paths.iter().map(|(_, _, path)| path.as_str()).collect();
        set_env(mapper, DEVICES_ENV, staged.join(" "));
    }

    Ok(())
}

fn derive_identity(context: &ClusterContext, node: &mut Node, default_name: String, role: ServerType) {
    if matches!(node.timeout, None | Some(0)) {
        node.timeout = Some(context.pod_timeout);
    }
    if node.name().is_empty() {
        node.metadata.name = Some(default_name);
    }
    if node.namespace().is_empty() {
        node.metadata.namespace = Some(context.namespace.clone());
    }
    node.server_type = Some(role);

    let name = node.name().to_string();
    node.spec.hostname = Some(name.clone());
    node.spec.subdomain = Some(context.name.clone());
    node.metadata.owner_references = Some(vec![context.owner.clone()]);

    let mut labels = node_group_labels(&context.name);
    labels.insert(NAME_LABEL.to_string(), name);
    labels.insert(context.name.clone(), role.role_label().to_string());
    node.metadata.labels = Some(labels);
}

fn claim_volume(name: &str, claim: String) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn upsert_volume(volumes: &mut Vec<Volume>, volume: Volume) {
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume,
        None => volumes.push(volume),
    }
}

fn attach_devices(container: &mut Container, devices: &[VolumeDevice]) {
    let attached = container.volume_devices.get_or_insert_with(Vec::new);
    for device in devices {
        match attached.iter_mut().find(|d| d.name == device.name) {
            Some(existing) => existing.clone_from(device),
            None => attached.push(device.clone()),
        }
    }
}

fn set_env(container: &mut Container, name: &str, value: String) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => existing.value = Some(value),
        None => env.push(EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        }),
    }
}
