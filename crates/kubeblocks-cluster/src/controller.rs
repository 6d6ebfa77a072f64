//! Cluster controller entry points
//!
//! One reconcile runs the transformer chain over a fresh
//! [`TransformContext`], applies the resulting graph and turns the outcome
//! into a controller action.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use kubeblocks_common::crd::Cluster;
use kubeblocks_common::events::{EventPublisher, KubeEventPublisher};
use kubeblocks_common::{Error, OperatorConfig, Result};

use crate::context::TransformContext;
use crate::executor::apply_graph;
use crate::lifecycle::{ExecLifecycleActions, LifecycleActions};
use crate::store::{ClusterStore, KubeClusterStore};
use crate::transformers::{cluster_transformers, run_pipeline};
use crate::CONTROLLER_NAME;

/// Shortest delay between two passes over the same cluster
const MIN_REQUEUE: Duration = Duration::from_secs(1);

/// Controller context shared by every reconcile
pub struct Context {
    /// Object store (trait object for testability)
    pub store: Arc<dyn ClusterStore>,
    /// Lifecycle action runner
    pub lifecycle: Arc<dyn LifecycleActions>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ClusterStore>,
        lifecycle: Arc<dyn LifecycleActions>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            lifecycle,
            events,
            config: Arc::new(OperatorConfig::default()),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client).config(config).build();
/// ```
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn ClusterStore>>,
    lifecycle: Option<Arc<dyn LifecycleActions>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: Option<Arc<OperatorConfig>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            lifecycle: None,
            events: None,
            config: None,
        }
    }

    /// Override the object store
    pub fn store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the lifecycle action runner
    pub fn lifecycle(mut self, lifecycle: Arc<dyn LifecycleActions>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the operator configuration
    pub fn config(mut self, config: Arc<OperatorConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeClusterStore::new(self.client.clone()))),
            lifecycle: self
                .lifecycle
                .unwrap_or_else(|| Arc::new(ExecLifecycleActions::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            config: self.config.unwrap_or_default(),
        }
    }
}

/// Reconcile a Cluster
///
/// Runs the transformer chain, applies the recorded writes and requeues
/// while the chain is waiting on something. A terminal error is returned
/// after its failure status has been written.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any(), namespace = ?cluster.namespace()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    debug!(generation = cluster.generation(), "reconciling cluster");

    let mut tctx = TransformContext::new(
        (*cluster).clone(),
        ctx.config.clone(),
        ctx.store.clone(),
        ctx.lifecycle.clone(),
        ctx.events.clone(),
    );
    let outcome = run_pipeline(&cluster_transformers(), &mut tctx).await;

    if let Err(apply_err) = apply_graph(ctx.store.as_ref(), &tctx.graph).await {
        warn!(error = %apply_err, "failed to apply cluster changes");
        return Err(outcome.err().unwrap_or(apply_err));
    }

    match outcome? {
        Some(after) => {
            let after = after.max(MIN_REQUEUE);
            debug!(after_secs = after.as_secs_f64(), "requeueing cluster");
            Ok(Action::requeue(after))
        }
        None => {
            info!(vertices = tctx.graph.len(), "cluster reconciled");
            Ok(Action::await_change())
        }
    }
}

/// Error policy for the Cluster controller
///
/// Retryable errors are retried after the configured backoff; the rest wait
/// for the next change to the cluster.
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(ctx.config.requeue_after_error)
    } else {
        Action::await_change()
    }
}
