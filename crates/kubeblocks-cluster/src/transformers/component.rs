//! Desired-versus-running diff of components and shardings
//!
//! The names of plain components and shardings are partitioned into delete,
//! update and create sets, handled in that order. Within a set, a declared
//! topology order turns the walk into a sequence of groups: an entity is only
//! handled once every entity of the previous group is ready (for create and
//! update) or gone (for delete). The first entity that has to wait ends the
//! walk with a delayed requeue; the rest are picked up by a later pass.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Affinity, PodAffinityTerm};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use tracing::{debug, info};

use kubeblocks_common::constants::{
    component_full_name, component_short_name, split_list, APP_INSTANCE_LABEL,
    COMPONENT_NAME_LABEL, COMPONENT_SCALE_IN_ANNOTATION, HOST_NETWORK_ANNOTATION,
    SHARDING_ADD_ANNOTATION, SHARDING_DEF_LABEL, SHARDING_NAME_LABEL,
    SHARD_POD_ANTI_AFFINITY_ANNOTATION, SHARD_TEMPLATE_LABEL,
};
use kubeblocks_common::crd::{
    Cluster, ClusterComponentSpec, ClusterTopology, ClusterTopologyOrders, Component,
    ComponentPhase, SidecarDefinition,
};
use kubeblocks_common::{Error, Result};

use super::sharding_lifecycle::{
    handle_post_provision, handle_pre_terminate, handle_shard_add_and_remove, mark_shards_to_add,
};
use super::Transformer;
use crate::builder::{build_component, cluster_labels, copy_and_merge};
use crate::context::TransformContext;
use crate::sidecar::resolve_sidecars;
use crate::sharding::DEFAULT_SHARD_TEMPLATE;

const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Creates, updates and deletes Components to match the resolved cluster
pub struct ComponentTransformer;

/// What is being done to a set of components or shardings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// Provision
    Create,
    /// Update in place
    Update,
    /// Terminate
    Delete,
}

impl Op {
    fn declared(self, orders: &ClusterTopologyOrders) -> &[String] {
        match self {
            Self::Create => &orders.provision,
            Self::Update => &orders.update,
            Self::Delete => &orders.terminate,
        }
    }
}

/// How the entities of one operation are sequenced
#[derive(Clone, Debug)]
pub enum Sequencer {
    /// No declared order; every entity is handled in one walk
    Parallel,
    /// Provision or update order; each group waits for the previous one to
    /// reach its expected phase
    OrderedCreateUpdate {
        /// Topology declaring the order
        topology: ClusterTopology,
        /// Comma-separated groups of slot names
        orders: Vec<String>,
        /// Treat a missing predecessor as ready (updates)
        ignore_not_exist: bool,
    },
    /// Terminate order; each group waits for the previous one to be gone
    OrderedDelete {
        /// Topology declaring the order
        topology: ClusterTopology,
        /// Comma-separated groups of slot names
        orders: Vec<String>,
    },
}

/// True if `name` is the entity `entity` of the topology
///
/// A sharding slot matches its own name only; a component slot also matches
/// the components instantiated from a template slot.
fn entity_matched(topology: &ClusterTopology, entity: &str, name: &str) -> bool {
    if topology.sharding(entity).is_some() {
        return entity == name;
    }
    topology
        .components
        .iter()
        .find(|c| c.name == entity)
        .is_some_and(|c| c.matches(name))
}

/// True if the component is settled in the phase its spec asks for
fn in_expected_phase(comp: &Component) -> bool {
    let expected = if comp.is_stopped() {
        ComponentPhase::Stopped
    } else {
        ComponentPhase::Running
    };
    comp.is_generation_observed() && comp.phase() == Some(expected)
}

impl Sequencer {
    /// The sequencer for `op` under the cluster's topology
    pub fn for_op(ctx: &TransformContext, op: Op) -> Self {
        let Some(topology) = ctx.topology() else {
            return Self::Parallel;
        };
        let orders = topology
            .orders
            .as_ref()
            .map(|o| op.declared(o).to_vec())
            .unwrap_or_default();
        if orders.is_empty() {
            return Self::Parallel;
        }
        match op {
            Op::Create | Op::Update => Self::OrderedCreateUpdate {
                topology: topology.clone(),
                orders,
                ignore_not_exist: op == Op::Update,
            },
            Op::Delete => Self::OrderedDelete {
                topology: topology.clone(),
                orders,
            },
        }
    }

    fn declared(&self) -> Option<(&ClusterTopology, &[String])> {
        match self {
            Self::Parallel => None,
            Self::OrderedCreateUpdate {
                topology, orders, ..
            }
            | Self::OrderedDelete { topology, orders } => Some((topology, orders.as_slice())),
        }
    }

    /// Arrange `names` in the declared order
    ///
    /// Every name must belong to some group of the order.
    pub fn ordered(&self, names: &BTreeSet<String>) -> Result<Vec<String>> {
        let Some((topology, orders)) = self.declared() else {
            return Ok(names.iter().cloned().collect());
        };

        let mut result: Vec<String> = Vec::with_capacity(names.len());
        for group in orders {
            for entity in split_list(group) {
                for name in names {
                    if entity_matched(topology, &entity, name) && !result.contains(name) {
                        result.push(name.clone());
                    }
                }
            }
        }
        if result.len() != names.len() {
            let missing: Vec<&str> = names
                .iter()
                .filter(|n| !result.contains(*n))
                .map(String::as_str)
                .collect();
            return Err(Error::resolution(format!(
                "cannot find order for components and shardings: {}",
                missing.join(",")
            )));
        }
        Ok(result)
    }

    /// Slot names of the group before the one holding `name`
    fn predecessors(&self, name: &str) -> Result<Vec<String>> {
        let Some((topology, orders)) = self.declared() else {
            return Ok(Vec::new());
        };
        let mut previous = Vec::new();
        for group in orders {
            let entities = split_list(group);
            if entities.iter().any(|e| entity_matched(topology, e, name)) {
                return Ok(previous);
            }
            previous = entities;
        }
        Err(Error::resolution(format!(
            "cannot find predecessor for component or sharding {}",
            name
        )))
    }

    /// True if `name` may be handled in this pass
    pub async fn ready(&self, ctx: &TransformContext, name: &str) -> Result<bool> {
        match self {
            Self::Parallel => Ok(true),
            Self::OrderedCreateUpdate {
                ignore_not_exist, ..
            } => {
                for pred in self.predecessors(name)? {
                    let ready = if ctx.is_sharding(&pred) {
                        sharding_ready(ctx, &pred, *ignore_not_exist).await?
                    } else {
                        component_ready(ctx, &pred, *ignore_not_exist).await?
                    };
                    if !ready {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::OrderedDelete { .. } => {
                for pred in self.predecessors(name)? {
                    let exists = if ctx.is_sharding(&pred) {
                        !list_shards(ctx, &pred).await?.is_empty()
                            || ctx.graph.has_sharding_create(&pred)
                    } else {
                        let full = component_full_name(&ctx.cluster_name(), &pred);
                        ctx.store.get_component(&ctx.namespace(), &full).await?.is_some()
                            || ctx.graph.has_create(&full)
                    };
                    if exists {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

async fn component_ready(ctx: &TransformContext, name: &str, ignore_not_exist: bool) -> Result<bool> {
    let full = component_full_name(&ctx.cluster_name(), name);
    match ctx.store.get_component(&ctx.namespace(), &full).await? {
        None => Ok(ignore_not_exist),
        Some(comp) => Ok(in_expected_phase(&comp) && !ctx.graph.has_component(&full)),
    }
}

async fn sharding_ready(ctx: &TransformContext, sharding: &str, ignore_not_exist: bool) -> Result<bool> {
    let desired = ctx
        .sharding_comps
        .get(sharding)
        .map(Vec::len)
        .ok_or_else(|| Error::impossible(format!("cluster sharding {} not found", sharding)))?;
    let shards = list_shards(ctx, sharding).await?;
    if shards.len() != desired {
        return Ok(shards.is_empty() && ignore_not_exist);
    }
    Ok(shards.iter().all(in_expected_phase) && !ctx.graph.has_sharding_vertex(sharding))
}

/// Running shards of a sharding
pub(crate) async fn list_shards(ctx: &TransformContext, sharding: &str) -> Result<Vec<Component>> {
    let labels = BTreeMap::from([
        (APP_INSTANCE_LABEL.to_string(), ctx.cluster_name()),
        (SHARDING_NAME_LABEL.to_string(), sharding.to_string()),
    ]);
    ctx.store.list_components(&ctx.namespace(), &labels).await
}

/// Sidecar definitions and the compDefs they are matched against
#[derive(Default)]
pub(crate) struct SidecarSource {
    definitions: Vec<SidecarDefinition>,
    cluster_comp_defs: BTreeSet<String>,
}

impl SidecarSource {
    pub(crate) async fn load(ctx: &TransformContext) -> Result<Self> {
        let cluster_comp_defs = ctx
            .components
            .iter()
            .chain(ctx.sharding_comps.values().flatten())
            .map(|spec| spec.component_def.clone())
            .collect();
        Ok(Self {
            definitions: ctx.store.list_sidecar_definitions().await?,
            cluster_comp_defs,
        })
    }

    fn build(
        &self,
        cluster: &Cluster,
        spec: &ClusterComponentSpec,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
        restore_key: &str,
        running: Option<&Component>,
    ) -> Result<Component> {
        let mut comp = build_component(cluster, spec, labels, annotations, restore_key)?;
        comp.spec.sidecars = resolve_sidecars(
            &self.definitions,
            &self.cluster_comp_defs,
            &spec.component_def,
            running,
        )?;
        Ok(comp)
    }
}

/// Handle `names` for `op`, in declared order
///
/// Returns a delayed requeue naming the first entity that has to wait.
pub(crate) async fn handle_in_order(
    ctx: &mut TransformContext,
    sidecars: &SidecarSource,
    names: &BTreeSet<String>,
    op: Op,
    scale_in: bool,
) -> Result<()> {
    if names.is_empty() {
        return Ok(());
    }
    let sequencer = Sequencer::for_op(ctx, op);
    for name in sequencer.ordered(names)? {
        if !sequencer.ready(ctx, &name).await? {
            return Err(Error::delayed_requeue(
                Duration::ZERO,
                format!("retry later: {} are not ready", name),
            ));
        }
        if ctx.is_sharding(&name) {
            handle_sharding(ctx, sidecars, &name, op, scale_in).await?;
        } else {
            handle_component(ctx, sidecars, &name, op, scale_in).await?;
        }
    }
    Ok(())
}

fn component_spec(ctx: &TransformContext, name: &str) -> Result<ClusterComponentSpec> {
    ctx.components
        .iter()
        .find(|c| c.name == name)
        .cloned()
        .ok_or_else(|| Error::impossible(format!("cluster component {} not found", name)))
}

/// Record the deletion of a running component
///
/// On scale-in the component is first marked so its own controller can tell
/// a shrink from a cluster teardown.
fn delete_component(ctx: &mut TransformContext, comp: &Component, scale_in: bool) {
    if comp.is_deleting() {
        return;
    }
    if !scale_in {
        ctx.graph.delete_component(comp.clone());
        return;
    }
    let mut marked = comp.clone();
    marked
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(COMPONENT_SCALE_IN_ANNOTATION.to_string(), "true".to_string());
    ctx.graph.update_component(marked.clone());
    ctx.graph.delete_component(marked);
}

async fn handle_component(
    ctx: &mut TransformContext,
    sidecars: &SidecarSource,
    name: &str,
    op: Op,
    scale_in: bool,
) -> Result<()> {
    let full = component_full_name(&ctx.cluster_name(), name);
    match op {
        Op::Create => {
            let spec = component_spec(ctx, name)?;
            let proto = sidecars.build(&ctx.cluster, &spec, BTreeMap::new(), BTreeMap::new(), name, None)?;
            info!(component = %full, "creating component");
            ctx.graph.create_component(proto);
        }
        Op::Update => {
            let Some(running) = ctx.store.get_component(&ctx.namespace(), &full).await? else {
                return Ok(());
            };
            let spec = component_spec(ctx, name)?;
            let proto = sidecars.build(
                &ctx.cluster,
                &spec,
                BTreeMap::new(),
                BTreeMap::new(),
                name,
                Some(&running),
            )?;
            if let Some(merged) = copy_and_merge(&running, &proto)? {
                debug!(component = %full, "updating component");
                ctx.graph.update_component(merged);
            }
        }
        Op::Delete => {
            if let Some(running) = ctx.store.get_component(&ctx.namespace(), &full).await? {
                info!(component = %full, scale_in, "deleting component");
                delete_component(ctx, &running, scale_in);
            }
        }
    }
    Ok(())
}

async fn handle_sharding(
    ctx: &mut TransformContext,
    sidecars: &SidecarSource,
    sharding: &str,
    op: Op,
    scale_in: bool,
) -> Result<()> {
    match op {
        Op::Create => {
            let protos = build_shards(ctx, sidecars, sharding, &[])?;
            info!(sharding, shards = protos.len(), "creating sharding");
            for proto in protos {
                ctx.graph.create_component(proto);
            }
            handle_post_provision(ctx, sharding, &[]).await
        }
        Op::Delete => {
            let running = list_shards(ctx, sharding).await?;
            handle_pre_terminate(ctx, sharding, &running).await?;
            info!(sharding, shards = running.len(), scale_in, "deleting sharding");
            for shard in &running {
                delete_component(ctx, shard, scale_in);
            }
            Ok(())
        }
        Op::Update => update_sharding(ctx, sidecars, sharding).await,
    }
}

async fn update_sharding(ctx: &mut TransformContext, sidecars: &SidecarSource, sharding: &str) -> Result<()> {
    let running = list_shards(ctx, sharding).await?;
    let mut protos = build_shards(ctx, sidecars, sharding, &running)?;

    let running_names: BTreeSet<String> = running.iter().map(|c| c.name_any()).collect();
    let proto_names: BTreeSet<String> = protos.iter().map(|c| c.name_any()).collect();
    let to_create: BTreeSet<String> = proto_names.difference(&running_names).cloned().collect();
    let to_delete: BTreeSet<String> = running_names.difference(&proto_names).cloned().collect();
    let to_update: BTreeSet<String> = running_names.intersection(&proto_names).cloned().collect();

    handle_post_provision(ctx, sharding, &running).await?;

    {
        let mut new: Vec<&mut Component> = protos
            .iter_mut()
            .filter(|p| to_create.contains(&p.name_any()))
            .collect();
        mark_shards_to_add(ctx, sharding, &mut new);
    }
    let added = handle_shard_add_and_remove(ctx, sharding, &running, &to_delete, &to_update).await?;

    for shard in running.iter().filter(|c| to_delete.contains(&c.name_any())) {
        info!(sharding, shard = %shard.name_any(), "removing shard");
        delete_component(ctx, shard, true);
    }

    for proto in protos.iter().filter(|p| to_update.contains(&p.name_any())) {
        let Some(current) = running.iter().find(|c| c.name_any() == proto.name_any()) else {
            continue;
        };
        let mut base = current.clone();
        let cleared = added.contains(&proto.name_any())
            && base
                .metadata
                .annotations
                .as_mut()
                .and_then(|a| a.remove(SHARDING_ADD_ANNOTATION))
                .is_some();
        match copy_and_merge(&base, proto)? {
            Some(merged) => ctx.graph.update_component(merged),
            None if cleared => ctx.graph.update_component(base),
            None => {}
        }
    }

    for proto in protos.into_iter().filter(|p| to_create.contains(&p.name_any())) {
        info!(sharding, shard = %proto.name_any(), "adding shard");
        ctx.graph.create_component(proto);
    }
    Ok(())
}

/// The host-network annotation for a shard, when the cluster lists its sharding
fn host_network_annotations(cluster: &Cluster, sharding: &str, shard: &str) -> BTreeMap<String, String> {
    let listed = cluster
        .annotation(HOST_NETWORK_ANNOTATION)
        .is_some_and(|v| split_list(v).iter().any(|n| n == sharding));
    if listed {
        BTreeMap::from([(HOST_NETWORK_ANNOTATION.to_string(), shard.to_string())])
    } else {
        BTreeMap::new()
    }
}

fn affinity_terms(affinity: &mut Affinity) -> Vec<&mut PodAffinityTerm> {
    let mut terms = Vec::new();
    if let Some(pod_affinity) = affinity.pod_affinity.as_mut() {
        terms.extend(
            pod_affinity
                .required_during_scheduling_ignored_during_execution
                .iter_mut()
                .flatten(),
        );
        terms.extend(
            pod_affinity
                .preferred_during_scheduling_ignored_during_execution
                .iter_mut()
                .flatten()
                .map(|w| &mut w.pod_affinity_term),
        );
    }
    if let Some(anti) = affinity.pod_anti_affinity.as_mut() {
        terms.extend(
            anti.required_during_scheduling_ignored_during_execution
                .iter_mut()
                .flatten(),
        );
        terms.extend(
            anti.preferred_during_scheduling_ignored_during_execution
                .iter_mut()
                .flatten()
                .map(|w| &mut w.pod_affinity_term),
        );
    }
    terms
}

/// Spread the pods of a shard
///
/// Affinity terms selecting an empty component name are bound to this
/// shard. Without such terms, a sharding listed in the anti-affinity
/// annotation gets a required anti-affinity across all of its shards.
pub fn apply_shard_scheduling(cluster: &Cluster, sharding: &str, shard: &str, comp: &mut Component) {
    let mut bound = false;
    if let Some(affinity) = comp
        .spec
        .scheduling_policy
        .as_mut()
        .and_then(|p| p.affinity.as_mut())
    {
        for term in affinity_terms(affinity) {
            let value = term
                .label_selector
                .as_mut()
                .and_then(|s| s.match_labels.as_mut())
                .and_then(|labels| labels.get_mut(COMPONENT_NAME_LABEL));
            if let Some(value) = value.filter(|v| v.is_empty()) {
                *value = shard.to_string();
                bound = true;
            }
        }
    }
    if bound {
        return;
    }

    let listed = cluster
        .annotation(SHARD_POD_ANTI_AFFINITY_ANNOTATION)
        .is_some_and(|v| split_list(v).iter().any(|n| n == sharding));
    if !listed {
        return;
    }
    let term = PodAffinityTerm {
        label_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([
                (APP_INSTANCE_LABEL.to_string(), cluster.name_any()),
                (SHARDING_NAME_LABEL.to_string(), sharding.to_string()),
            ])),
            ..Default::default()
        }),
        topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
        ..Default::default()
    };
    comp.spec
        .scheduling_policy
        .get_or_insert_with(Default::default)
        .affinity
        .get_or_insert_with(Default::default)
        .pod_anti_affinity
        .get_or_insert_with(Default::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(Vec::new)
        .push(term);
}

/// Build the desired shard Components of a sharding
pub(crate) fn build_shards(
    ctx: &TransformContext,
    sidecars: &SidecarSource,
    sharding: &str,
    running: &[Component],
) -> Result<Vec<Component>> {
    let spec = ctx
        .shardings
        .iter()
        .find(|s| s.name == sharding)
        .ok_or_else(|| Error::impossible(format!("cluster sharding {} not found", sharding)))?;
    let by_template = ctx
        .sharding_comps_with_tpl
        .get(sharding)
        .ok_or_else(|| Error::impossible(format!("shards of sharding {} are not built", sharding)))?;

    let cluster_name = ctx.cluster_name();
    let mut shards = Vec::new();
    for (template, specs) in by_template {
        let sharding_def = spec
            .shard_templates
            .iter()
            .find(|t| &t.name == template)
            .and_then(|t| t.sharding_def.clone())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| spec.sharding_def.clone());

        let mut labels = BTreeMap::from([(SHARDING_NAME_LABEL.to_string(), sharding.to_string())]);
        if !sharding_def.is_empty() {
            labels.insert(SHARDING_DEF_LABEL.to_string(), sharding_def);
        }
        if template != DEFAULT_SHARD_TEMPLATE {
            labels.insert(SHARD_TEMPLATE_LABEL.to_string(), template.clone());
        }

        for shard_spec in specs {
            let full = component_full_name(&cluster_name, &shard_spec.name);
            let current = running.iter().find(|c| c.name_any() == full);
            let mut comp = sidecars.build(
                &ctx.cluster,
                shard_spec,
                labels.clone(),
                host_network_annotations(&ctx.cluster, sharding, &shard_spec.name),
                sharding,
                current,
            )?;
            apply_shard_scheduling(&ctx.cluster, sharding, &shard_spec.name, &mut comp);
            shards.push(comp);
        }
    }
    Ok(shards)
}

/// Names of running plain components and shardings
///
/// Also records the shardings that still have shards, so they are
/// recognized after leaving the spec.
pub(crate) async fn running_entities(ctx: &mut TransformContext) -> Result<(BTreeSet<String>, Vec<Component>)> {
    let cluster_name = ctx.cluster_name();
    let comps = ctx
        .store
        .list_components(&ctx.namespace(), &cluster_labels(&cluster_name))
        .await?;
    let mut names = BTreeSet::new();
    for comp in &comps {
        match comp.sharding_name() {
            Some(sharding) => {
                ctx.running_shardings.insert(sharding.to_string());
                names.insert(sharding.to_string());
            }
            None => {
                names.insert(component_short_name(&cluster_name, &comp.name_any()));
            }
        }
    }
    Ok((names, comps))
}

#[async_trait]
impl Transformer for ComponentTransformer {
    fn name(&self) -> &'static str {
        "component"
    }

    async fn transform(&self, ctx: &mut TransformContext) -> Result<()> {
        if ctx.orig_cluster.is_deleting() {
            return Ok(());
        }

        let (running, comps) = running_entities(ctx).await?;
        let generation = ctx.cluster.generation();
        if !ctx.orig_cluster.is_updating()
            && comps.len() == ctx.total()
            && comps.iter().all(|c| c.is_up_to_date(generation))
        {
            debug!(cluster = %ctx.cluster_name(), "all components up to date");
            return Ok(());
        }

        let desired: BTreeSet<String> = ctx
            .components
            .iter()
            .map(|c| c.name.clone())
            .chain(ctx.shardings.iter().map(|s| s.name.clone()))
            .collect();
        let to_delete: BTreeSet<String> = running.difference(&desired).cloned().collect();
        let to_update: BTreeSet<String> = running.intersection(&desired).cloned().collect();
        let to_create: BTreeSet<String> = desired.difference(&running).cloned().collect();
        debug!(
            create = ?to_create,
            update = ?to_update,
            delete = ?to_delete,
            "component diff"
        );

        let sidecars = SidecarSource::load(ctx).await?;

        handle_in_order(ctx, &sidecars, &to_delete, Op::Delete, true).await?;

        let delayed = match handle_in_order(ctx, &sidecars, &to_update, Op::Update, false).await {
            Ok(()) => None,
            Err(err @ Error::DelayedRequeue { .. }) => Some(err),
            Err(err) => return Err(err),
        };

        handle_in_order(ctx, &sidecars, &to_create, Op::Create, false).await?;

        match delayed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
