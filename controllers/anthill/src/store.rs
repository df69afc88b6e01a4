//! Object-store collaborator.
//!
//! The orchestrator, rollout waiter, device wiper and topology sync talk to
//! Kubernetes only through [`ObjectStore`], so they can be exercised against
//! the in-memory store in `test_utils`.

use crate::error::StoreError;
use async_trait::async_trait;
use crds::GlusterCluster;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::{self, Debug};
use tracing::debug;

/// Kinds of dependent objects the controller manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Service,
    ConfigMap,
    Secret,
    ServiceAccount,
    RoleBinding,
    StorageClass,
    PersistentVolume,
    PersistentVolumeClaim,
    Deployment,
}

impl ObjectKind {
    /// Whether objects of this kind live outside namespaces.
    #[must_use]
    pub fn cluster_scoped(self) -> bool {
        matches!(self, ObjectKind::StorageClass | ObjectKind::PersistentVolume)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// CRUD access to the objects the controller manages.
///
/// Create calls report an existing object as [`StoreError::AlreadyExists`];
/// callers decide whether that counts as success.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_service(&self, service: &Service) -> Result<(), StoreError>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), StoreError>;
    async fn create_secret(&self, secret: &Secret) -> Result<(), StoreError>;
    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), StoreError>;
    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), StoreError>;
    async fn create_storage_class(&self, class: &StorageClass) -> Result<(), StoreError>;
    async fn create_persistent_volume(&self, volume: &PersistentVolume) -> Result<(), StoreError>;
    async fn create_persistent_volume_claim(&self, claim: &PersistentVolumeClaim) -> Result<(), StoreError>;

    /// Create a deployment, returning it as stored.
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError>;
    /// Replace a deployment; fails with `Conflict` when its resource version is outdated.
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;

    /// Delete an object; `namespace` is ignored for cluster-scoped kinds.
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, StoreError>;

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<GlusterCluster, StoreError>;
    /// Write the status of `cluster`, guarded by its resource version.
    async fn update_cluster_status(&self, cluster: &GlusterCluster) -> Result<GlusterCluster, StoreError>;
}

/// [`ObjectStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl Debug for KubeObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeObjectStore").finish_non_exhaustive()
    }
}

impl KubeObjectStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create_in<K>(api: Api<K>, object: &K) -> Result<K, StoreError>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        debug!("Creating {}", object.name_any());
        Ok(api.create(&PostParams::default(), object).await?)
    }

    async fn delete_in<K>(api: Api<K>, name: &str) -> Result<(), StoreError>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        debug!("Deleting {}", name);
        api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn create_service(&self, service: &Service) -> Result<(), StoreError> {
        let api = self.namespaced(&service.namespace().unwrap_or_default());
        Self::create_in(api, service).await.map(drop)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), StoreError> {
        let api = self.namespaced(&config_map.namespace().unwrap_or_default());
        Self::create_in(api, config_map).await.map(drop)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), StoreError> {
        let api = self.namespaced(&secret.namespace().unwrap_or_default());
        Self::create_in(api, secret).await.map(drop)
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<(), StoreError> {
        let api = self.namespaced(&account.namespace().unwrap_or_default());
        Self::create_in(api, account).await.map(drop)
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> Result<(), StoreError> {
        let api = self.namespaced(&binding.namespace().unwrap_or_default());
        Self::create_in(api, binding).await.map(drop)
    }

    async fn create_storage_class(&self, class: &StorageClass) -> Result<(), StoreError> {
        Self::create_in(Api::all(self.client.clone()), class).await.map(drop)
    }

    async fn create_persistent_volume(&self, volume: &PersistentVolume) -> Result<(), StoreError> {
        Self::create_in(Api::all(self.client.clone()), volume).await.map(drop)
    }

    async fn create_persistent_volume_claim(&self, claim: &PersistentVolumeClaim) -> Result<(), StoreError> {
        let api = self.namespaced(&claim.namespace().unwrap_or_default());
        Self::create_in(api, claim).await.map(drop)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        let api = self.namespaced(&deployment.namespace().unwrap_or_default());
        Self::create_in(api, deployment).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        Ok(self.namespaced::<Deployment>(namespace).get(name).await?)
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        let api = self.namespaced::<Deployment>(&deployment.namespace().unwrap_or_default());
        Ok(api
            .replace(&deployment.name_any(), &PostParams::default(), deployment)
            .await?)
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<(), StoreError> {
        let client = self.client.clone();
        match kind {
            ObjectKind::Service => Self::delete_in(self.namespaced::<Service>(namespace), name).await,
            ObjectKind::ConfigMap => Self::delete_in(self.namespaced::<ConfigMap>(namespace), name).await,
            ObjectKind::Secret => Self::delete_in(self.namespaced::<Secret>(namespace), name).await,
            ObjectKind::ServiceAccount => {
                Self::delete_in(self.namespaced::<ServiceAccount>(namespace), name).await
            }
            ObjectKind::RoleBinding => Self::delete_in(self.namespaced::<RoleBinding>(namespace), name).await,
            ObjectKind::StorageClass => Self::delete_in(Api::<StorageClass>::all(client), name).await,
            ObjectKind::PersistentVolume => Self::delete_in(Api::<PersistentVolume>::all(client), name).await,
            ObjectKind::PersistentVolumeClaim => {
                Self::delete_in(self.namespaced::<PersistentVolumeClaim>(namespace), name).await
            }
            ObjectKind::Deployment => Self::delete_in(self.namespaced::<Deployment>(namespace), name).await,
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, StoreError> {
        let pods = self
            .namespaced::<Pod>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<GlusterCluster, StoreError> {
        Ok(self.namespaced::<GlusterCluster>(namespace).get(name).await?)
    }

    async fn update_cluster_status(&self, cluster: &GlusterCluster) -> Result<GlusterCluster, StoreError> {
        let api = self.namespaced::<GlusterCluster>(&cluster.namespace().unwrap_or_default());

        // The resource version makes the server reject writes based on an outdated read
        let status_patch = serde_json::json!({
            "metadata": { "resourceVersion": cluster.resource_version() },
            "status": cluster.status,
        });

        Ok(api
            .patch_status(
                &cluster.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&status_patch),
            )
            .await?)
    }
}
