//! Builders for the dependent objects of a cluster.
//!
//! Pure functions from the defaulted cluster, node or volume to the object
//! the orchestrator creates.

use crate::defaults::{GROUP_LABEL, node_group_labels};
use crds::{GlusterCluster, HeketiConfig, Node, NodeVolume};
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodTemplateSpec, Secret,
    Service, ServiceAccount, ServicePort, ServiceSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Config map key holding the topology manager configuration.
pub const CONFIG_KEY: &str = "heketi.json";
/// Secret key holding the topology manager database backup.
pub const DB_KEY: &str = "heketi.db";

pub fn config_map_name(node: &Node) -> String {
    format!("{}-config", node.name())
}

pub fn db_secret_name(node: &Node) -> String {
    format!("{}-db-secret", node.name())
}

pub fn service_account_name(node: &Node) -> String {
    format!("{}-service-account", node.name())
}

pub fn role_binding_name(node: &Node) -> String {
    format!("{}-role-binding", node.name())
}

fn component_labels(group: String, component: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from([
        (GROUP_LABEL.to_string(), group),
        ("heketi".to_string(), component.to_string()),
    ]))
}

/// Headless service giving every node pod a stable DNS name.
pub fn service(cluster: &GlusterCluster) -> Service {
    let name = cluster.name_any();
    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cluster.namespace(),
            owner_references: cluster.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(node_group_labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some("dummy".to_string()),
                protocol: Some("TCP".to_string()),
                port: 1,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn config_map(node: &Node, config: &HeketiConfig) -> Result<ConfigMap, serde_json::Error> {
    let name = config_map_name(node);
    Ok(ConfigMap {
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), serde_json::to_string(config)?)])),
        metadata: ObjectMeta {
            labels: component_labels(name.clone(), "config"),
            name: Some(name),
            namespace: Some(node.namespace().to_string()),
            owner_references: node.metadata.owner_references.clone(),
            ..Default::default()
        },
        ..Default::default()
    })
}

pub fn db_secret(node: &Node) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(db_secret_name(node)),
            namespace: Some(node.namespace().to_string()),
            owner_references: node.metadata.owner_references.clone(),
            labels: Some(BTreeMap::from([("deploy-heketi".to_string(), "support".to_string())])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(DB_KEY.to_string(), ByteString(Vec::new()))])),
        ..Default::default()
    }
}

pub fn service_account(node: &Node) -> ServiceAccount {
    let name = service_account_name(node);
    ServiceAccount {
        metadata: ObjectMeta {
            labels: component_labels(name.clone(), "service-account"),
            name: Some(name),
            namespace: Some(node.namespace().to_string()),
            owner_references: node.metadata.owner_references.clone(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Binds the node's service account to `cluster_role`.
pub fn role_binding(node: &Node, cluster_role: &str) -> RoleBinding {
    let name = role_binding_name(node);
    RoleBinding {
        metadata: ObjectMeta {
            labels: component_labels(name.clone(), "role-binding"),
            name: Some(name),
            namespace: Some(node.namespace().to_string()),
            owner_references: node.metadata.owner_references.clone(),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name(node),
            namespace: Some(node.namespace().to_string()),
            ..Default::default()
        }]),
    }
}

/// Local storage class for a provisioned volume, if it names one.
pub fn storage_class(volume: &NodeVolume) -> Option<StorageClass> {
    let name = volume.spec.storage_class_name.clone().filter(|n| !n.is_empty())?;
    Some(StorageClass {
        metadata: ObjectMeta {
            name: Some(name),
            owner_references: volume.metadata.owner_references.clone(),
            ..Default::default()
        },
        provisioner: "kubernetes.io/no-provisioner".to_string(),
        volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
        ..Default::default()
    })
}

pub fn persistent_volume(volume: &NodeVolume) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(volume.name().to_string()),
            labels: volume.metadata.labels.clone(),
            owner_references: volume.metadata.owner_references.clone(),
            ..Default::default()
        },
        spec: Some(volume.spec.clone()),
        ..Default::default()
    }
}

/// Claim binding `volume` by name and by its labels.
pub fn persistent_volume_claim(volume: &NodeVolume) -> PersistentVolumeClaim {
    let storage = volume
        .spec
        .capacity
        .as_ref()
        .and_then(|capacity| capacity.get("storage"))
        .cloned();

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(volume.claim_name()),
            namespace: volume.metadata.namespace.clone(),
            owner_references: volume.metadata.owner_references.clone(),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: volume.spec.access_modes.clone(),
            selector: Some(LabelSelector {
                match_labels: volume.metadata.labels.clone(),
                ..Default::default()
            }),
            volume_name: Some(volume.name().to_string()),
            // An empty class keeps the claim away from the default dynamic provisioner
            storage_class_name: Some(volume.spec.storage_class_name.clone().unwrap_or_default()),
            volume_mode: volume.spec.volume_mode.clone(),
            resources: storage.map(|quantity| VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), quantity)])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Single-replica deployment running the node's pod template.
pub fn deployment(node: &Node) -> Deployment {
    let labels = node.metadata.labels.clone();
    Deployment {
        metadata: ObjectMeta {
            name: Some(node.name().to_string()),
            namespace: Some(node.namespace().to_string()),
            labels: labels.clone(),
            owner_references: node.metadata.owner_references.clone(),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: labels.clone(),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(node.name().to_string()),
                    labels,
                    owner_references: node.metadata.owner_references.clone(),
                    ..Default::default()
                }),
                spec: Some(node.spec.clone()),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::{default_cluster, kernel_modules_volume};
    use crate::test_utils::{create_test_cluster, storage_node_with_devices};

    fn defaulted() -> GlusterCluster {
        let mut raw = create_test_cluster("alpha", "storage", "1");
        raw.spec.nodes = vec![storage_node_with_devices(1)];
        default_cluster(&raw).unwrap()
    }

    #[test]
    fn test_service_is_headless_and_selects_nodes() {
        let cluster = defaulted();
        let service = service(&cluster);
        let spec = service.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.selector.unwrap()["anthill-group"], "alpha-node");
        assert_eq!(service.metadata.owner_references.unwrap()[0].name, "alpha");
    }

    #[test]
    fn test_config_map_holds_serialized_config() {
        let cluster = defaulted();
        let heketi = cluster.spec.heketi.unwrap();
        let node = heketi.node.unwrap();
        let config = heketi.config.unwrap();

        let map = config_map(&node, &config).unwrap();
        assert_eq!(map.metadata.name.as_deref(), Some("alpha-topology-manager-config"));
        let document: serde_json::Value = serde_json::from_str(&map.data.unwrap()[CONFIG_KEY]).unwrap();
        assert_eq!(document["port"], "8080");
        assert_eq!(document["use_auth"], true);
    }

    #[test]
    fn test_role_binding_targets_service_account() {
        let cluster = defaulted();
        let node = cluster.spec.heketi.unwrap().node.unwrap();
        let binding = role_binding(&node, "anthill");
        assert_eq!(binding.role_ref.name, "anthill");
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.name, "alpha-topology-manager-service-account");
        assert_eq!(subject.namespace.as_deref(), Some("storage"));
    }

    #[test]
    fn test_volume_objects() {
        let cluster = defaulted();
        let node = &cluster.spec.nodes[0];
        let volume = &node.devices[0];

        let class = storage_class(volume).unwrap();
        assert_eq!(class.metadata.name.as_deref(), Some("alpha-0-volumes"));
        assert_eq!(class.volume_binding_mode.as_deref(), Some("WaitForFirstConsumer"));

        let pv = persistent_volume(volume);
        assert_eq!(pv.metadata.name.as_deref(), Some("alpha-0-0"));
        assert_eq!(pv.metadata.labels, volume.metadata.labels);

        let claim = persistent_volume_claim(volume);
        assert_eq!(claim.metadata.name.as_deref(), Some("alpha-0-0-claim"));
        assert_eq!(claim.metadata.namespace.as_deref(), Some("storage"));
        let spec = claim.spec.unwrap();
        assert_eq!(spec.volume_name.as_deref(), Some("alpha-0-0"));
        assert_eq!(spec.volume_mode.as_deref(), Some("Block"));
        assert_eq!(spec.selector.unwrap().match_labels, volume.metadata.labels);

        assert!(storage_class(&kernel_modules_volume(node)).is_none());
    }

    #[test]
    fn test_deployment_wraps_pod_template() {
        let cluster = defaulted();
        let node = &cluster.spec.nodes[0];
        let deployment = deployment(node);
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.selector.match_labels, node.metadata.labels);
        assert_eq!(spec.template.spec.as_ref(), Some(&node.spec));
    }
}
