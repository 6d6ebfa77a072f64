//! Object store access for the cluster controller
//!
//! Transformers read through [`ClusterStore`] and never write directly; their
//! writes are recorded in the mutation graph and applied by the executor
//! through the write half of the same trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubeblocks_common::crd::{
    Cluster, ClusterDefinition, Component, ComponentDefinition, ComponentVersion,
    ShardingDefinition, SidecarDefinition, TerminationPolicy,
};
use kubeblocks_common::{label_selector, Error, Result, FIELD_MANAGER};

/// Namespaced kinds a cluster owns besides its components
///
/// They carry the `app.kubernetes.io/instance` label and are removed by the
/// deletion driver according to the termination policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OwnedKind {
    /// Services
    Service,
    /// Secrets, including account secrets
    Secret,
    /// ConfigMaps
    ConfigMap,
    /// Data volumes
    PersistentVolumeClaim,
    /// Data-protection backups
    Backup,
}

impl OwnedKind {
    /// Kinds deleted under a termination policy
    pub fn for_policy(policy: TerminationPolicy) -> &'static [OwnedKind] {
        match policy {
            TerminationPolicy::DoNotTerminate => &[],
            TerminationPolicy::Delete => &[
                OwnedKind::Service,
                OwnedKind::Secret,
                OwnedKind::ConfigMap,
                OwnedKind::PersistentVolumeClaim,
            ],
            TerminationPolicy::WipeOut => &[
                OwnedKind::Service,
                OwnedKind::Secret,
                OwnedKind::ConfigMap,
                OwnedKind::PersistentVolumeClaim,
                OwnedKind::Backup,
            ],
        }
    }
}

impl std::fmt::Display for OwnedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service => write!(f, "Service"),
            Self::Secret => write!(f, "Secret"),
            Self::ConfigMap => write!(f, "ConfigMap"),
            Self::PersistentVolumeClaim => write!(f, "PersistentVolumeClaim"),
            Self::Backup => write!(f, "Backup"),
        }
    }
}

/// Trait abstracting object store operations for the cluster controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Get a ClusterDefinition by name
    async fn get_cluster_definition(&self, name: &str) -> Result<Option<ClusterDefinition>>;

    /// List all ComponentDefinitions
    async fn list_component_definitions(&self) -> Result<Vec<ComponentDefinition>>;

    /// List all ComponentVersions
    async fn list_component_versions(&self) -> Result<Vec<ComponentVersion>>;

    /// List all ShardingDefinitions
    async fn list_sharding_definitions(&self) -> Result<Vec<ShardingDefinition>>;

    /// Get a ShardingDefinition by name
    async fn get_sharding_definition(&self, name: &str) -> Result<Option<ShardingDefinition>>;

    /// List all SidecarDefinitions
    async fn list_sidecar_definitions(&self) -> Result<Vec<SidecarDefinition>>;

    /// Get a Component by its full name
    async fn get_component(&self, namespace: &str, name: &str) -> Result<Option<Component>>;

    /// List Components matching all of the given labels
    async fn list_components(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Component>>;

    /// Get a Secret by name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Names of owned objects of a kind matching all of the given labels
    async fn list_owned(
        &self,
        namespace: &str,
        kind: OwnedKind,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<String>>;

    /// Replace the cluster's metadata and spec
    async fn update_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Patch the cluster's status subresource
    async fn patch_cluster_status(&self, cluster: &Cluster) -> Result<()>;

    /// Create a Component
    async fn create_component(&self, component: &Component) -> Result<()>;

    /// Replace a Component
    async fn update_component(&self, component: &Component) -> Result<()>;

    /// Delete a Component
    async fn delete_component(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create a Secret
    async fn create_secret(&self, secret: &Secret) -> Result<()>;

    /// Delete an owned object
    async fn delete_owned(&self, namespace: &str, kind: OwnedKind, name: &str) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    /// Create a new KubeClusterStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn backup_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            "dataprotection.kubeblocks.io",
            "v1alpha1",
            "Backup",
        ))
    }

    async fn list_all<K>(&self) -> Result<Vec<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_names<K>(&self, namespace: &str, selector: &str) -> Result<Vec<String>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items.iter().map(|o| o.name_any()).collect())
    }
}

fn ignore_not_found(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or_else(|| Error::internal_with_context("store", format!("{} has no namespace", obj.name_any())))
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get_cluster_definition(&self, name: &str) -> Result<Option<ClusterDefinition>> {
        let api: Api<ClusterDefinition> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_component_definitions(&self) -> Result<Vec<ComponentDefinition>> {
        self.list_all().await
    }

    async fn list_component_versions(&self) -> Result<Vec<ComponentVersion>> {
        self.list_all().await
    }

    async fn list_sharding_definitions(&self) -> Result<Vec<ShardingDefinition>> {
        self.list_all().await
    }

    async fn get_sharding_definition(&self, name: &str) -> Result<Option<ShardingDefinition>> {
        let api: Api<ShardingDefinition> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_sidecar_definitions(&self) -> Result<Vec<SidecarDefinition>> {
        self.list_all().await
    }

    async fn get_component(&self, namespace: &str, name: &str) -> Result<Option<Component>> {
        let api: Api<Component> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_components(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Component>> {
        let api: Api<Component> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&lp).await?.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_owned(
        &self,
        namespace: &str,
        kind: OwnedKind,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let selector = label_selector(labels);
        match kind {
            OwnedKind::Service => self.list_names::<Service>(namespace, &selector).await,
            OwnedKind::Secret => self.list_names::<Secret>(namespace, &selector).await,
            OwnedKind::ConfigMap => self.list_names::<ConfigMap>(namespace, &selector).await,
            OwnedKind::PersistentVolumeClaim => {
                self.list_names::<PersistentVolumeClaim>(namespace, &selector)
                    .await
            }
            OwnedKind::Backup => {
                let api: Api<DynamicObject> = Api::namespaced_with(
                    self.client.clone(),
                    namespace,
                    &Self::backup_resource(),
                );
                match api.list(&ListParams::default().labels(&selector)).await {
                    Ok(list) => Ok(list.items.iter().map(|o| o.name_any()).collect()),
                    // the data-protection CRDs are optional
                    Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<()> {
        let namespace = namespace_of(cluster)?;
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&cluster.name_any(), &PostParams::default(), cluster)
            .await?;
        Ok(())
    }

    async fn patch_cluster_status(&self, cluster: &Cluster) -> Result<()> {
        let namespace = namespace_of(cluster)?;
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": cluster.status });
        let result = api
            .patch_status(
                &cluster.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map(|_| ());
        ignore_not_found(result)
    }

    async fn create_component(&self, component: &Component) -> Result<()> {
        let namespace = namespace_of(component)?;
        let api: Api<Component> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), component).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!(component = %component.name_any(), "component already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_component(&self, component: &Component) -> Result<()> {
        let namespace = namespace_of(component)?;
        let api: Api<Component> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&component.name_any(), &PostParams::default(), component)
            .await?;
        Ok(())
    }

    async fn delete_component(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Component> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = namespace_of(secret)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), secret).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_owned(&self, namespace: &str, kind: OwnedKind, name: &str) -> Result<()> {
        let dp = DeleteParams::background();
        let result = match kind {
            OwnedKind::Service => {
                let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &dp).await.map(|_| ())
            }
            OwnedKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &dp).await.map(|_| ())
            }
            OwnedKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &dp).await.map(|_| ())
            }
            OwnedKind::PersistentVolumeClaim => {
                let api: Api<PersistentVolumeClaim> =
                    Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &dp).await.map(|_| ())
            }
            OwnedKind::Backup => {
                let api: Api<DynamicObject> = Api::namespaced_with(
                    self.client.clone(),
                    namespace,
                    &Self::backup_resource(),
                );
                api.delete(name, &dp).await.map(|_| ())
            }
        };
        ignore_not_found(result)
    }
}
