//! State shared by the transformers of one reconcile pass

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use rand::rngs::StdRng;
use rand::SeedableRng;

use kubeblocks_common::crd::{
    Cluster, ClusterComponentSpec, ClusterDefinition, ClusterSharding, ClusterTopology,
    ComponentDefinition, ShardingDefinition,
};
use kubeblocks_common::events::EventPublisher;
use kubeblocks_common::OperatorConfig;

use crate::dag::MutationGraph;
use crate::lifecycle::LifecycleActions;
use crate::store::ClusterStore;

/// Everything a transformer can see and change during one pass
pub struct TransformContext {
    /// The cluster as read at the start of the pass
    pub orig_cluster: Cluster,
    /// Working copy; metadata, spec and status edits are committed at the end
    pub cluster: Cluster,
    /// Referenced ClusterDefinition, if any
    pub cluster_def: Option<ClusterDefinition>,
    /// Resolved ComponentDefinitions by definition name
    pub component_defs: BTreeMap<String, ComponentDefinition>,
    /// Resolved ShardingDefinitions by definition name
    pub sharding_defs: BTreeMap<String, ShardingDefinition>,
    /// Resolved component specs
    pub components: Vec<ClusterComponentSpec>,
    /// Resolved shardings
    pub shardings: Vec<ClusterSharding>,
    /// Per-shard component specs by sharding name
    pub sharding_comps: BTreeMap<String, Vec<ClusterComponentSpec>>,
    /// Per-shard component specs by sharding name, then shard template
    pub sharding_comps_with_tpl: BTreeMap<String, BTreeMap<String, Vec<ClusterComponentSpec>>>,
    /// Shardings that currently have running shards
    pub running_shardings: BTreeSet<String>,
    /// Mutations recorded in this pass
    pub graph: MutationGraph,
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
    /// Object store
    pub store: Arc<dyn ClusterStore>,
    /// Lifecycle action runner
    pub lifecycle: Arc<dyn LifecycleActions>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Source of randomness for shard ids and target shard selection
    pub rng: StdRng,
}

impl TransformContext {
    /// Start a pass over `cluster`
    pub fn new(
        cluster: Cluster,
        config: Arc<OperatorConfig>,
        store: Arc<dyn ClusterStore>,
        lifecycle: Arc<dyn LifecycleActions>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            orig_cluster: cluster.clone(),
            cluster,
            cluster_def: None,
            component_defs: BTreeMap::new(),
            sharding_defs: BTreeMap::new(),
            components: Vec::new(),
            shardings: Vec::new(),
            sharding_comps: BTreeMap::new(),
            sharding_comps_with_tpl: BTreeMap::new(),
            running_shardings: BTreeSet::new(),
            graph: MutationGraph::new(),
            config,
            store,
            lifecycle,
            events,
            rng: StdRng::from_entropy(),
        }
    }

    /// Replace the random source, for deterministic shard ids
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Cluster name
    pub fn cluster_name(&self) -> String {
        self.cluster.name_any()
    }

    /// Cluster namespace
    pub fn namespace(&self) -> String {
        self.cluster.namespace_or_default()
    }

    /// Number of desired Components: plain components plus every shard
    pub fn total(&self) -> usize {
        self.components.len() + self.sharding_comps.values().map(Vec::len).sum::<usize>()
    }

    /// Topology selected by the cluster, if it uses a ClusterDefinition
    pub fn topology(&self) -> Option<&ClusterTopology> {
        self.cluster_def
            .as_ref()
            .and_then(|def| def.topology(&self.cluster.spec.topology))
    }

    /// True if `name` is a sharding, desired or still running
    pub fn is_sharding(&self, name: &str) -> bool {
        self.shardings.iter().any(|s| s.name == name)
            || self.running_shardings.contains(name)
            || self.topology().is_some_and(|t| t.sharding(name).is_some())
    }

    /// Reference to the cluster for events
    pub fn cluster_ref(&self) -> ObjectReference {
        self.orig_cluster.object_ref(&())
    }

    /// Publish an event on the cluster
    pub async fn event(&self, type_: EventType, reason: &str, action: &str, note: impl Into<String>) {
        self.events
            .publish(&self.cluster_ref(), type_, reason, action, Some(note.into()))
            .await;
    }
}
