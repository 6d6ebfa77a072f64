//! InstanceSet controller entry points

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use kubeblocks_common::crd::InstanceSet;
use kubeblocks_common::events::{EventPublisher, KubeEventPublisher};
use kubeblocks_common::{Error, OperatorConfig, Result};

use crate::executor::apply_plan;
use crate::reconciler::{instance_set_reconcilers, run_reconcilers};
use crate::store::{load_tree, InstanceSetStore, KubeInstanceSetStore};
use crate::tree::ObjectTree;
use crate::CONTROLLER_NAME;

/// Shortest delay between two passes over the same set
const MIN_REQUEUE: Duration = Duration::from_secs(1);

/// Controller context shared by every reconcile
pub struct Context {
    /// Object store (trait object for testability)
    pub store: Arc<dyn InstanceSetStore>,
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
    pub fn for_testing(store: Arc<dyn InstanceSetStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            events,
            config: Arc::new(OperatorConfig::default()),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn InstanceSetStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: Option<Arc<OperatorConfig>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            events: None,
            config: None,
        }
    }

    /// Override the object store
    pub fn store(mut self, store: Arc<dyn InstanceSetStore>) -> Self {
        self.store = Some(store);
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
                .unwrap_or_else(|| Arc::new(KubeInstanceSetStore::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            config: self.config.unwrap_or_default(),
        }
    }
}

async fn publish_events(its: &InstanceSet, tree: &ObjectTree, events: &dyn EventPublisher) {
    let reference = its.object_ref(&());
    for event in tree.events() {
        let type_ = if event.warning {
            EventType::Warning
        } else {
            EventType::Normal
        };
        events
            .publish(&reference, type_, &event.reason, &event.action, Some(event.note.clone()))
            .await;
    }
}

/// Reconcile an InstanceSet
///
/// Loads the tree, runs the reconciler chain and applies the difference. A
/// reconciler error writes nothing; its events are still published.
#[instrument(skip(its, ctx), fields(instance_set = %its.name_any(), namespace = ?its.namespace()))]
pub async fn reconcile(its: Arc<InstanceSet>, ctx: Arc<Context>) -> Result<Action> {
    debug!(generation = ?its.metadata.generation, "reconciling instance set");

    let mut tree = load_tree(ctx.store.as_ref(), &its, Utc::now()).await?;
    let outcome = run_reconcilers(&instance_set_reconcilers(), &mut tree, &ctx.config);

    let retry = match outcome {
        Ok(retry) => retry,
        Err(err) => {
            publish_events(&its, &tree, ctx.events.as_ref()).await;
            return Err(err);
        }
    };

    let plan = tree.plan();
    if let Err(err) = apply_plan(ctx.store.as_ref(), &plan).await {
        warn!(error = %err, "failed to apply instance set changes");
        return Err(err);
    }
    publish_events(&its, &tree, ctx.events.as_ref()).await;

    match retry {
        Some(after) => {
            let after = after.max(MIN_REQUEUE);
            debug!(after_secs = after.as_secs_f64(), "requeueing instance set");
            Ok(Action::requeue(after))
        }
        None => {
            info!(writes = plan.len(), "instance set reconciled");
            Ok(Action::await_change())
        }
    }
}

/// Error policy for the InstanceSet controller
///
/// Retryable errors are retried after the configured backoff; the rest wait
/// for the next change to the set.
pub fn error_policy(its: Arc<InstanceSet>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        instance_set = %its.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(ctx.config.requeue_after_error)
    } else {
        Action::await_change()
    }
}
