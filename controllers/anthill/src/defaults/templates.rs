//! Default documents merged under every cluster spec.
//!
//! Each constructor returns a fresh value, so defaulting never shares or
//! mutates global state.

use crds::{
    GlusterBlockSpec, GlusterClusterSpec, GlusterFsConfig, GlusterfsSpec, HeketiConfig,
    HeketiSpec, JwtConfig, JwtIssuer, KubeExecConfig, Node, NodeVolume, ServerType,
    VolumeProvisioner,
};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HTTPGetAction, HostPathVolumeSource, ObjectFieldSelector, PersistentVolumeSpec, PodSpec,
    Probe, ResourceRequirements, SecurityContext, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// Directory inside storage pods where raw devices are staged.
pub const DEVICE_DIR: &str = "/dev/gluster/";

const DEFAULT_JWT_KEY: &str = "My Secret";
const HEKETI_PORT: i32 = 8080;
const GLUSTERD_PORT: i32 = 24007;

pub fn cluster_defaults() -> GlusterClusterSpec {
    GlusterClusterSpec {
        pod_timeout: Some(300),
        heketi: Some(HeketiSpec {
            native: Some(true),
            config: Some(heketi_config_defaults()),
            node: Some(heketi_node_defaults()),
            ..Default::default()
        }),
        glusterfs: Some(GlusterfsSpec {
            native: Some(true),
            provisioner: Some(provisioner(
                "gluster.org/glusterfile",
                "gluster/glusterfileclone:latest",
            )),
            ..Default::default()
        }),
        glusterblock: Some(GlusterBlockSpec {
            provisioner: Some(provisioner(
                "gluster.org/glusterblock",
                "gluster/glusterblock-provisioner:latest",
            )),
        }),
        ..Default::default()
    }
}

fn provisioner(name: &str, image: &str) -> VolumeProvisioner {
    VolumeProvisioner {
        name: Some(name.to_string()),
        image: Some(image.to_string()),
        create_storage_class: Some(true),
    }
}

pub fn heketi_config_defaults() -> HeketiConfig {
    let issuer = JwtIssuer {
        key: Some(DEFAULT_JWT_KEY.to_string()),
    };

    HeketiConfig {
        port: Some(HEKETI_PORT.to_string()),
        use_auth: Some(true),
        jwt: Some(JwtConfig {
            admin: Some(issuer.clone()),
            user: Some(issuer),
        }),
        backup_db_to_kube_secret: Some(true),
        glusterfs: Some(GlusterFsConfig {
            executor: Some("kubernetes".to_string()),
            db: Some("/var/lib/heketi/heketi.db".to_string()),
            kubeexec: Some(KubeExecConfig {
                fstab: Some("/var/lib/heketi/fstab".to_string()),
                snapshot_limit: Some(14),
                ..Default::default()
            }),
            auto_create_block_hosting_volume: Some(true),
            block_hosting_volume_size: Some(100),
            ignore_stale_operations: Some(true),
            ..Default::default()
        }),
    }
}

pub fn heketi_node_defaults() -> Node {
    let hello_probe = |initial_delay_seconds| Probe {
        initial_delay_seconds: Some(initial_delay_seconds),
        timeout_seconds: Some(3),
        http_get: Some(HTTPGetAction {
            path: Some("/hello".to_string()),
            port: IntOrString::Int(HEKETI_PORT),
            ..Default::default()
        }),
        ..Default::default()
    };

    let container = Container {
        name: "heketi".to_string(),
        image: Some("heketi/heketi:dev".to_string()),
        image_pull_policy: Some("Always".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: HEKETI_PORT,
            ..Default::default()
        }]),
        env: Some(vec![
            env("HEKETI_CLI_SERVER", &format!("http://localhost:{HEKETI_PORT}")),
            env("HEKETI_CLI_KEY", DEFAULT_JWT_KEY),
            env("HEKETI_CLI_USER", "admin"),
        ]),
        resources: Some(small_requests()),
        volume_mounts: Some(vec![mount("config", "/etc/heketi"), mount("backupdb", "/backupdb")]),
        liveness_probe: Some(hello_probe(3)),
        readiness_probe: Some(hello_probe(30)),
        ..Default::default()
    };

    Node {
        server_type: Some(ServerType::TopologyManager),
        spec: PodSpec {
            containers: vec![container],
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn gluster_node_defaults() -> Node {
    Node {
        server_type: Some(ServerType::Storage),
        zone: Some(1),
        state_volume: Some(NodeVolume {
            provision: Some(true),
            spec: PersistentVolumeSpec {
                capacity: Some(storage_capacity("1Gi")),
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                host_path: Some(HostPathVolumeSource {
                    path: "/var/lib/glusterfs-containers".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        spec: PodSpec {
            volumes: Some(vec![
                Volume {
                    name: "run".to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
                host_path_volume("lvm", "/run/lvm"),
                host_path_volume("dev", "/dev"),
                Volume {
                    name: "blkdevbridge".to_string(),
                    empty_dir: Some(EmptyDirVolumeSource {
                        medium: Some("Memory".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Storage container inserted into every storage node.
pub fn gluster_container_defaults() -> Container {
    let glusterd_probe = || Probe {
        initial_delay_seconds: Some(30),
        timeout_seconds: Some(3),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(50),
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(GLUSTERD_PORT),
            ..Default::default()
        }),
        ..Default::default()
    };

    Container {
        name: "glusterfs".to_string(),
        image: Some("jarrpa/gluster-fedora-minimal:dev".to_string()),
        image_pull_policy: Some("Always".to_string()),
        ports: Some(
            [3260, 24006, GLUSTERD_PORT]
                .into_iter()
                .map(|container_port| ContainerPort {
                    container_port,
                    ..Default::default()
                })
                .collect(),
        ),
        env: Some(vec![EnvVar {
            name: "GLUSTERFS_NODE_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.labels['name']".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        resources: Some(small_requests()),
        volume_mounts: Some(vec![
            mount("gluster-state", "/glusterfs"),
            VolumeMount {
                read_only: Some(true),
                ..mount("kernel-modules", "/usr/lib/modules")
            },
            mount("run", "/run"),
            mount("blkdevbridge", DEVICE_DIR),
        ]),
        liveness_probe: Some(glusterd_probe()),
        readiness_probe: Some(glusterd_probe()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            capabilities: Some(Capabilities {
                add: Some(vec!["SYS_MODULE".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Init container copying the claimed block devices into the shared bridge.
pub fn block_mapper_container_defaults() -> Container {
    Container {
        name: "blkdevmapper".to_string(),
        image: Some("busybox:latest".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec!["cp -a $(DEVICES) /mnt".to_string()]),
        volume_mounts: Some(vec![mount("blkdevbridge", "/mnt")]),
        ..Default::default()
    }
}

pub fn node_volume_defaults() -> NodeVolume {
    NodeVolume {
        provision: Some(true),
        spec: PersistentVolumeSpec {
            capacity: Some(storage_capacity("1Gi")),
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            volume_mode: Some("Block".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn storage_capacity(quantity: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([("storage".to_string(), Quantity(quantity.to_string()))])
}

fn small_requests() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("100m".to_string())),
            ("memory".to_string(), Quantity("100Mi".to_string())),
        ])),
        ..Default::default()
    }
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}
