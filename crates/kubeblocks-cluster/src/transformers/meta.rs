//! Cluster finalizer and labels

use async_trait::async_trait;
use kube::ResourceExt;

use kubeblocks_common::constants::{CLUSTER_DEF_LABEL, CLUSTER_FINALIZER};
use kubeblocks_common::Result;

use super::Transformer;
use crate::context::TransformContext;

/// Ensures the finalizer and the ClusterDefinition label on live clusters
pub struct MetaTransformer;

#[async_trait]
impl Transformer for MetaTransformer {
    fn name(&self) -> &'static str {
        "meta"
    }

    async fn transform(&self, ctx: &mut TransformContext) -> Result<()> {
        if ctx.orig_cluster.is_deleting() {
            return Ok(());
        }

        if !ctx.cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
            ctx.cluster.finalizers_mut().push(CLUSTER_FINALIZER.to_string());
        }

        let cluster_def = ctx.cluster.spec.cluster_def.clone();
        if !cluster_def.is_empty() {
            ctx.cluster
                .labels_mut()
                .insert(CLUSTER_DEF_LABEL.to_string(), cluster_def);
        }
        Ok(())
    }
}
