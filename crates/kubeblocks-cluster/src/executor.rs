//! Applies a pass's mutation graph to the store

use kube::ResourceExt;
use tracing::{debug, info};

use kubeblocks_common::{Error, Result};

use crate::dag::{ClusterObject, MutationGraph, Verb};
use crate::store::ClusterStore;

/// Apply every vertex in insertion order
///
/// Stops at the first failed write; the next pass recomputes whatever was
/// left. Deleting an object that is already gone counts as success.
pub async fn apply_graph(store: &dyn ClusterStore, graph: &MutationGraph) -> Result<()> {
    for vertex in graph.vertices() {
        debug!(verb = %vertex.verb, kind = %vertex.object.kind(), name = %vertex.object.name(), "applying");
        match (&vertex.verb, &vertex.object) {
            (Verb::Update, ClusterObject::Cluster(cluster)) => store.update_cluster(cluster).await?,
            (Verb::Status, ClusterObject::Cluster(cluster)) => {
                store.patch_cluster_status(cluster).await?
            }
            (Verb::Create, ClusterObject::Component(comp)) => {
                info!(component = %comp.name_any(), "creating component");
                store.create_component(comp).await?
            }
            (Verb::Update, ClusterObject::Component(comp)) => store.update_component(comp).await?,
            (Verb::Delete, ClusterObject::Component(comp)) => {
                info!(component = %comp.name_any(), "deleting component");
                let namespace = comp.namespace().unwrap_or_default();
                ignore_not_found(store.delete_component(&namespace, &comp.name_any()).await)?
            }
            (Verb::Create, ClusterObject::Secret(secret)) => store.create_secret(secret).await?,
            (Verb::Delete, ClusterObject::Owned { kind, namespace, name }) => {
                info!(kind = %kind, name = %name, "deleting owned object");
                ignore_not_found(store.delete_owned(namespace, *kind, name).await)?
            }
            (verb, object) => {
                return Err(Error::impossible(format!(
                    "unsupported mutation {} on {} {}",
                    verb,
                    object.kind(),
                    object.name()
                )))
            }
        }
    }
    Ok(())
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
