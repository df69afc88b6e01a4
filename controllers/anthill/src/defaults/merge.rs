//! First-writer-wins merge of default values into a spec.
//!
//! A value the user set is always kept. Unset means `None`, an empty string,
//! or an empty list or map. Explicit numbers and booleans count as set even
//! when zero or `false`, so a user can switch a default off. Nested
//! structures merge field by field; lists are taken whole, never merged
//! element-wise; maps gain the default keys they lack.

use crate::diff::volume_source;
use crds::{
    GlusterBlockSpec, GlusterClusterSpec, GlusterFsConfig, GlusterfsSpec, HeketiConfig,
    HeketiSpec, JwtConfig, JwtIssuer, KubeExecConfig, Node, NodeVolume, ServerType,
    SshExecConfig, VolumeProvisioner,
};
use k8s_openapi::api::core::v1::{PersistentVolumeSpec, PodSpec};
use std::collections::BTreeMap;

/// Fill unset fields of `self` from `defaults`.
pub trait Merge {
    fn merge_from(&mut self, defaults: &Self);
}

impl Merge for String {
    fn merge_from(&mut self, defaults: &Self) {
        if self.is_empty() {
            self.clone_from(defaults);
        }
    }
}

macro_rules! merge_as_set {
    ($($ty:ty),*) => {
        $(
            impl Merge for $ty {
                fn merge_from(&mut self, _defaults: &Self) {}
            }
        )*
    };
}

merge_as_set!(bool, i32, i64, ServerType);

impl<T: Clone> Merge for Vec<T> {
    fn merge_from(&mut self, defaults: &Self) {
        if self.is_empty() {
            self.clone_from(defaults);
        }
    }
}

impl<K: Ord + Clone, V: Clone> Merge for BTreeMap<K, V> {
    fn merge_from(&mut self, defaults: &Self) {
        for (key, value) in defaults {
            self.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

impl<T: Merge + Clone> Merge for Option<T> {
    fn merge_from(&mut self, defaults: &Self) {
        match (self.as_mut(), defaults) {
            (None, Some(default)) => *self = Some(default.clone()),
            (Some(value), Some(default)) => value.merge_from(default),
            _ => {}
        }
    }
}

/// Implements [`Merge`] by merging the listed fields.
macro_rules! merge_fields {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl Merge for $ty {
            fn merge_from(&mut self, defaults: &Self) {
                $( self.$field.merge_from(&defaults.$field); )*
            }
        }
    };
}

// Nodes are defaulted one by one during derivation, so the list is left alone
merge_fields!(GlusterClusterSpec { pod_timeout, heketi, glusterfs, glusterblock });
merge_fields!(HeketiSpec { native, image, admin_secret, config, node });
merge_fields!(GlusterfsSpec { native, image, provisioner });
merge_fields!(GlusterBlockSpec { provisioner });
merge_fields!(VolumeProvisioner { name, image, create_storage_class });
merge_fields!(HeketiConfig { port, use_auth, jwt, backup_db_to_kube_secret, glusterfs });
merge_fields!(JwtConfig { admin, user });
merge_fields!(JwtIssuer { key });
merge_fields!(GlusterFsConfig {
    db,
    executor,
    allocator,
    sshexec,
    kubeexec,
    loglevel,
    brick_max_size_gb,
    brick_min_size_gb,
    max_bricks_per_volume,
    auto_create_block_hosting_volume,
    block_hosting_volume_size,
    ignore_stale_operations,
});
merge_fields!(KubeExecConfig {
    fstab,
    sudo,
    snapshot_limit,
    rebalance_on_expansion,
    namespace,
    gluster_daemonset,
    use_pod_names,
});
merge_fields!(SshExecConfig { fstab, sudo, keyfile, user, port });
merge_fields!(Node { timeout, server_type, ip_address, zone, devices, state_volume, spec });
merge_fields!(NodeVolume { provision, spec });

impl Merge for PodSpec {
    fn merge_from(&mut self, defaults: &Self) {
        self.containers.merge_from(&defaults.containers);
        self.init_containers.merge_from(&defaults.init_containers);
        self.volumes.merge_from(&defaults.volumes);
        self.service_account_name.merge_from(&defaults.service_account_name);
        self.node_selector.merge_from(&defaults.node_selector);
    }
}

impl Merge for PersistentVolumeSpec {
    fn merge_from(&mut self, defaults: &Self) {
        // A volume has exactly one source: take the default only when none is set
        if volume_source(self) == PersistentVolumeSpec::default() {
            let own = std::mem::take(self);
            *self = PersistentVolumeSpec {
                capacity: own.capacity,
                access_modes: own.access_modes,
                claim_ref: own.claim_ref,
                mount_options: own.mount_options,
                node_affinity: own.node_affinity,
                persistent_volume_reclaim_policy: own.persistent_volume_reclaim_policy,
                storage_class_name: own.storage_class_name,
                volume_mode: own.volume_mode,
                ..volume_source(defaults)
            };
        }

        self.capacity.merge_from(&defaults.capacity);
        self.access_modes.merge_from(&defaults.access_modes);
        self.volume_mode.merge_from(&defaults.volume_mode);
        self.storage_class_name.merge_from(&defaults.storage_class_name);
        self.persistent_volume_reclaim_policy
            .merge_from(&defaults.persistent_volume_reclaim_policy);
        self.mount_options.merge_from(&defaults.mount_options);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{HostPathVolumeSource, LocalVolumeSource};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    #[test]
    fn test_unset_values_take_defaults() {
        let mut value: Option<String> = None;
        value.merge_from(&Some("default".to_string()));
        assert_eq!(value.as_deref(), Some("default"));

        let mut empty = Some(String::new());
        empty.merge_from(&Some("default".to_string()));
        assert_eq!(empty.as_deref(), Some("default"));

        let mut list: Vec<i32> = vec![];
        list.merge_from(&vec![1, 2]);
        assert_eq!(list, vec![1, 2]);
    }

    #[test]
    fn test_set_values_win() {
        let mut flag = Some(false);
        flag.merge_from(&Some(true));
        assert_eq!(flag, Some(false));

        let mut zero = Some(0);
        zero.merge_from(&Some(300));
        assert_eq!(zero, Some(0));

        let mut list = vec![3];
        list.merge_from(&vec![1, 2]);
        assert_eq!(list, vec![3]);
    }

    #[test]
    fn test_maps_gain_missing_keys_only() {
        let mut map = BTreeMap::from([("a".to_string(), "user".to_string())]);
        map.merge_from(&BTreeMap::from([
            ("a".to_string(), "default".to_string()),
            ("b".to_string(), "default".to_string()),
        ]));
        assert_eq!(map["a"], "user");
        assert_eq!(map["b"], "default");
    }

    #[test]
    fn test_nested_structures_merge_per_field() {
        let mut spec = HeketiSpec {
            image: Some("custom/heketi:1".to_string()),
            config: Some(HeketiConfig {
                port: Some("9090".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let defaults = HeketiSpec {
            native: Some(true),
            image: Some("heketi/heketi:dev".to_string()),
            config: Some(HeketiConfig {
                port: Some("8080".to_string()),
                use_auth: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        spec.merge_from(&defaults);

        assert_eq!(spec.native, Some(true));
        assert_eq!(spec.image.as_deref(), Some("custom/heketi:1"));
        let config = spec.config.unwrap();
        assert_eq!(config.port.as_deref(), Some("9090"));
        assert_eq!(config.use_auth, Some(true));
    }

    #[test]
    fn test_volume_source_is_not_mixed_with_default_source() {
        let defaults = PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([("storage".to_string(), Quantity("1Gi".to_string()))])),
            host_path: Some(HostPathVolumeSource {
                path: "/var/lib/glusterfs-containers".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut local = PersistentVolumeSpec {
            local: Some(LocalVolumeSource {
                path: "/mnt/disk".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        local.merge_from(&defaults);
        assert!(local.host_path.is_none());
        assert_eq!(local.capacity, defaults.capacity);

        let mut bare = PersistentVolumeSpec {
            storage_class_name: Some("fast".to_string()),
            ..Default::default()
        };
        bare.merge_from(&defaults);
        assert_eq!(bare.host_path, defaults.host_path);
        assert_eq!(bare.storage_class_name.as_deref(), Some("fast"));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let defaults = crate::defaults::templates::cluster_defaults();
        let mut first = GlusterClusterSpec::default();
        let mut second = GlusterClusterSpec::default();
        first.merge_from(&defaults);
        second.merge_from(&defaults);
        assert_eq!(first, second);
        assert_eq!(first.pod_timeout, Some(300));
    }
}
