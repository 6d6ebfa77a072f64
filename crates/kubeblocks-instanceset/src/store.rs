//! Object store access for the InstanceSet controller
//!
//! Reconcilers only see the [`ObjectTree`]; the store loads it and applies
//! the writes computed from it.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kubeblocks_common::crd::InstanceSet;
use kubeblocks_common::{label_selector, Error, Result, FIELD_MANAGER};

use crate::instance::match_labels;
use crate::tree::{ObjectTree, TreeObject};

/// Trait abstracting object store operations for the InstanceSet controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceSetStore: Send + Sync {
    /// List pods matching all of the given labels
    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Pod>>;

    /// List claims matching all of the given labels
    async fn list_pvcs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    /// List config maps matching all of the given labels
    async fn list_config_maps(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMap>>;

    /// List services matching all of the given labels
    async fn list_services(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>>;

    /// Create a secondary object; one that already exists is left alone
    async fn create_object(&self, object: &TreeObject) -> Result<()>;

    /// Replace a secondary object
    async fn update_object(&self, object: &TreeObject) -> Result<()>;

    /// Delete a secondary object; one already gone counts as deleted
    async fn delete_object(&self, object: &TreeObject) -> Result<()>;

    /// Replace the set's metadata and spec
    async fn update_instance_set(&self, its: &InstanceSet) -> Result<()>;

    /// Patch the set's status subresource
    async fn patch_instance_set_status(&self, its: &InstanceSet) -> Result<()>;
}

/// Load `its` and every secondary object carrying its labels
pub async fn load_tree(
    store: &dyn InstanceSetStore,
    its: &InstanceSet,
    now: DateTime<Utc>,
) -> Result<ObjectTree> {
    let namespace = its.namespace().unwrap_or_default();
    let labels = match_labels(its);

    let mut objects: Vec<TreeObject> = Vec::new();
    objects.extend(store.list_config_maps(&namespace, &labels).await?.into_iter().map(TreeObject::from));
    objects.extend(store.list_services(&namespace, &labels).await?.into_iter().map(TreeObject::from));
    objects.extend(store.list_pvcs(&namespace, &labels).await?.into_iter().map(TreeObject::from));
    objects.extend(store.list_pods(&namespace, &labels).await?.into_iter().map(TreeObject::from));
    debug!(objects = objects.len(), "loaded instance set tree");

    Ok(ObjectTree::new(its.clone(), now).with_objects(objects))
}

/// Real Kubernetes client implementation
pub struct KubeInstanceSetStore {
    client: Client,
}

impl KubeInstanceSetStore {
    /// Create a new KubeInstanceSetStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn list<K>(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let lp = ListParams::default().labels(&label_selector(labels));
        Ok(self.api::<K>(namespace).list(&lp).await?.items)
    }

    async fn create<K>(&self, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api = self.api::<K>(&namespace_of(object)?);
        match api.create(&PostParams::default(), object).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!(name = %object.name_any(), "object already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace<K>(&self, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api = self.api::<K>(&namespace_of(object)?);
        api.replace(&object.name_any(), &PostParams::default(), object)
            .await?;
        Ok(())
    }

    async fn delete<K>(&self, object: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api = self.api::<K>(&namespace_of(object)?);
        match api.delete(&object.name_any(), &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or_else(|| Error::internal_with_context("store", format!("{} has no namespace", obj.name_any())))
}

#[async_trait]
impl InstanceSetStore for KubeInstanceSetStore {
    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Pod>> {
        self.list(namespace, labels).await
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        self.list(namespace, labels).await
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMap>> {
        self.list(namespace, labels).await
    }

    async fn list_services(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>> {
        self.list(namespace, labels).await
    }

    async fn create_object(&self, object: &TreeObject) -> Result<()> {
        match object {
            TreeObject::ConfigMap(o) => self.create(o.as_ref()).await,
            TreeObject::Service(o) => self.create(o.as_ref()).await,
            TreeObject::Pvc(o) => self.create(o.as_ref()).await,
            TreeObject::Pod(o) => self.create(o.as_ref()).await,
        }
    }

    async fn update_object(&self, object: &TreeObject) -> Result<()> {
        match object {
            TreeObject::ConfigMap(o) => self.replace(o.as_ref()).await,
            TreeObject::Service(o) => self.replace(o.as_ref()).await,
            TreeObject::Pvc(o) => self.replace(o.as_ref()).await,
            TreeObject::Pod(o) => self.replace(o.as_ref()).await,
        }
    }

    async fn delete_object(&self, object: &TreeObject) -> Result<()> {
        match object {
            TreeObject::ConfigMap(o) => self.delete(o.as_ref()).await,
            TreeObject::Service(o) => self.delete(o.as_ref()).await,
            TreeObject::Pvc(o) => self.delete(o.as_ref()).await,
            TreeObject::Pod(o) => self.delete(o.as_ref()).await,
        }
    }

    async fn update_instance_set(&self, its: &InstanceSet) -> Result<()> {
        self.replace(its).await
    }

    async fn patch_instance_set_status(&self, its: &InstanceSet) -> Result<()> {
        let api = self.api::<InstanceSet>(&namespace_of(its)?);
        let patch = serde_json::json!({ "status": its.status });
        match api
            .patch_status(&its.name_any(), &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
