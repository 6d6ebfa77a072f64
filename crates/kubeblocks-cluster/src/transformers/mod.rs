//! The cluster transformer chain
//!
//! Each transformer reads the cluster and the store through the
//! [`TransformContext`] and records the writes it wants in the mutation
//! graph. [`run_pipeline`] drives the chain and classifies the outcome:
//!
//! - `PrematureStop` ends the chain without failing the pass
//! - a delayed requeue is remembered and the chain goes on
//! - an immediate requeue ends the chain, the graph is still committed
//! - anything else is terminal: pending writes are dropped and only a status
//!   carrying the failure condition is written

pub mod component;
pub mod deletion;
pub mod meta;
pub mod normalization;
pub mod shared_account;
pub mod sharding_lifecycle;
pub mod status;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use kubeblocks_common::crd::{set_condition, ClusterStatus, Condition, ConditionStatus};
use kubeblocks_common::{Error, Result};

use crate::context::TransformContext;
use crate::dag::{ClusterObject, Verb};

pub use component::ComponentTransformer;
pub use deletion::DeletionTransformer;
pub use meta::MetaTransformer;
pub use normalization::NormalizationTransformer;
pub use shared_account::SharedAccountTransformer;
pub use status::StatusTransformer;

/// Condition set by normalization once the topology resolves
pub const CONDITION_PROVISIONING_STARTED: &str = "ProvisioningStarted";
/// Condition reporting whether the pass could record its writes
pub const CONDITION_APPLY_RESOURCES: &str = "ApplyResources";
/// Condition set when the cluster becomes Running, cleared on failures
pub const CONDITION_READY: &str = "Ready";
/// Condition mirroring the availability of every component
pub const CONDITION_AVAILABLE: &str = "Available";

/// One step of a cluster reconcile pass
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// Inspect the context and record mutations
    async fn transform(&self, ctx: &mut TransformContext) -> Result<()>;
}

/// The chain run for every Cluster, in order
pub fn cluster_transformers() -> Vec<Box<dyn Transformer>> {
    vec![
        Box::new(NormalizationTransformer),
        Box::new(DeletionTransformer),
        Box::new(MetaTransformer),
        Box::new(ComponentTransformer),
        Box::new(SharedAccountTransformer),
        Box::new(StatusTransformer),
    ]
}

/// Mutable status of the working cluster, created on first use
pub(crate) fn status_mut(ctx: &mut TransformContext) -> &mut ClusterStatus {
    ctx.cluster.status.get_or_insert_with(ClusterStatus::default)
}

/// Set a condition on the working cluster for its current generation
///
/// Returns true if the condition changed.
pub(crate) fn set_cluster_condition(
    ctx: &mut TransformContext,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) -> bool {
    let generation = ctx.cluster.metadata.generation;
    let condition = Condition::new(type_, status, reason, message).with_generation(generation);
    set_condition(&mut status_mut(ctx).conditions, condition)
}

/// Run the chain
///
/// Returns `Ok(None)` when the pass converged, `Ok(Some(delay))` when it
/// should run again after `delay`, and the terminal error otherwise. In
/// every case the graph in `ctx` is ready to be applied.
pub async fn run_pipeline(
    transformers: &[Box<dyn Transformer>],
    ctx: &mut TransformContext,
) -> Result<Option<Duration>> {
    let mut delayed: Option<Duration> = None;

    for transformer in transformers {
        let err = match transformer.transform(ctx).await {
            Ok(()) => continue,
            Err(err) => err,
        };

        if err.is_premature_stop() {
            debug!(transformer = transformer.name(), "stopping the pass early");
            break;
        }
        if let Error::DelayedRequeue { after, .. } = &err {
            debug!(transformer = transformer.name(), reason = %err, "requeue requested");
            delayed = Some(delayed.map_or(*after, |d| d.min(*after)));
            continue;
        }
        if err.is_requeue() {
            // an immediate requeue wins over any delay collected so far
            debug!(transformer = transformer.name(), reason = %err, "requeue requested, stopping the pass");
            delayed = err.requeue_after();
            break;
        }

        warn!(transformer = transformer.name(), error = %err, "transformer failed");
        ctx.graph.clear();
        set_cluster_condition(
            ctx,
            CONDITION_APPLY_RESOURCES,
            ConditionStatus::False,
            err.condition_reason(),
            err.to_string(),
        );
        seal_status(ctx);
        return Err(err);
    }

    seal(ctx);
    Ok(delayed)
}

/// Record the cluster's own writes, after every child write
fn seal(ctx: &mut TransformContext) {
    let orig = &ctx.orig_cluster;
    let cluster = &ctx.cluster;
    let meta_changed = cluster.metadata.labels != orig.metadata.labels
        || cluster.metadata.annotations != orig.metadata.annotations
        || cluster.metadata.finalizers != orig.metadata.finalizers;
    if meta_changed || cluster.spec != orig.spec {
        ctx.graph
            .add(Verb::Update, ClusterObject::Cluster(Box::new(cluster.clone())));
    }
    seal_status(ctx);
}

fn seal_status(ctx: &mut TransformContext) {
    if ctx.cluster.status != ctx.orig_cluster.status {
        ctx.graph.add(
            Verb::Status,
            ClusterObject::Cluster(Box::new(ctx.cluster.clone())),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_cluster, Fixtures};
    use kubeblocks_common::crd::find_condition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        name: &'static str,
        result: fn() -> Result<()>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transformer for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn transform(&self, ctx: &mut TransformContext) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.cluster
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(self.name.to_string(), "seen".to_string());
            (self.result)()
        }
    }

    fn step(name: &'static str, result: fn() -> Result<()>) -> (Box<dyn Transformer>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Scripted {
                name,
                result,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn test_success_records_cluster_update() {
        let mut ctx = Fixtures::default().context(sample_cluster());
        let (a, _) = step("a", || Ok(()));
        let outcome = run_pipeline(&[a], &mut ctx).await.unwrap();

        assert!(outcome.is_none());
        assert_eq!(ctx.graph.len(), 1);
        assert_eq!(ctx.graph.vertices()[0].verb, Verb::Update);
    }

    #[tokio::test]
    async fn test_premature_stop_skips_later_steps() {
        let mut ctx = Fixtures::default().context(sample_cluster());
        let (a, _) = step("a", || Err(Error::PrematureStop));
        let (b, b_calls) = step("b", || Ok(()));

        let outcome = run_pipeline(&[a, b], &mut ctx).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delayed_requeue_keeps_earliest_and_continues() {
        let mut ctx = Fixtures::default().context(sample_cluster());
        let (a, _) = step("a", || Err(Error::delayed_requeue(Duration::from_secs(9), "a")));
        let (b, b_calls) = step("b", || Err(Error::delayed_requeue(Duration::from_secs(3), "b")));
        let (c, c_calls) = step("c", || Ok(()));

        let outcome = run_pipeline(&[a, b, c], &mut ctx).await.unwrap();
        assert_eq!(outcome, Some(Duration::from_secs(3)));
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_immediate_requeue_overrides_earlier_delay() {
        let mut ctx = Fixtures::default().context(sample_cluster());
        let (a, _) = step("a", || Err(Error::delayed_requeue(Duration::from_secs(3), "post-provision")));
        let (b, _) = step("b", || Err(Error::requeue("shard removal pending")));
        let (c, c_calls) = step("c", || Ok(()));

        let outcome = run_pipeline(&[a, b, c], &mut ctx).await.unwrap();
        assert_eq!(outcome, Some(Duration::ZERO));
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_immediate_requeue_stops_chain() {
        let mut ctx = Fixtures::default().context(sample_cluster());
        let (a, _) = step("a", || Err(Error::requeue("waiting")));
        let (b, b_calls) = step("b", || Ok(()));

        let outcome = run_pipeline(&[a, b], &mut ctx).await.unwrap();
        assert_eq!(outcome, Some(Duration::ZERO));
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert!(!ctx.graph.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_error_writes_only_failure_status() {
        let mut ctx = Fixtures::default().context(sample_cluster());
        let (a, _) = step("a", || Ok(()));
        let (b, _) = step("b", || Err(Error::validation("bad shards")));

        let err = run_pipeline(&[a, b], &mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("bad shards"));

        let vertices = ctx.graph.vertices();
        assert_eq!(vertices.len(), 1);
        assert_eq!(vertices[0].verb, Verb::Status);
        let ClusterObject::Cluster(cluster) = &vertices[0].object else {
            panic!("expected the cluster");
        };
        let status = cluster.status.as_ref().unwrap();
        let condition = find_condition(&status.conditions, CONDITION_APPLY_RESOURCES).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, "InvalidSpec");
    }
}
