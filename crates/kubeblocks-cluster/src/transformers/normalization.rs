//! Topology resolution
//!
//! Turns the user's cluster into concrete component and sharding specs:
//! slots of the referenced topology are expanded, definition patterns and
//! service versions are resolved to names, shardings are expanded into
//! shards, and the resolved specs are written back so later passes start
//! from concrete values.
//!
//! Definitions are pinned to what a component already runs unless the spec
//! asks for something different, so an unrelated reconcile never upgrades
//! or downgrades a running component.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use kubeblocks_common::constants::{
    component_full_name, APPS_API_VERSION, APP_INSTANCE_LABEL, CRD_API_VERSION_ANNOTATION,
    SHARDING_DEF_LABEL, SHARDING_NAME_LABEL, SHARD_TEMPLATE_LABEL,
};
use kubeblocks_common::crd::{
    ClusterComponentSpec, ClusterSharding, ClusterTopology, Component, ComponentDefinition,
    ComponentVersion, ConditionStatus, ShardingDefinition,
};
use kubeblocks_common::matching::{
    compare_service_version, filter_by_name_pattern, prefix_or_regex_matched, service_version_cmp,
};
use kubeblocks_common::{Error, Result};

use super::{set_cluster_condition, Transformer, CONDITION_PROVISIONING_STARTED};
use crate::context::TransformContext;
use crate::sharding::{build_sharding_comp_specs, flatten_shard_specs};

const REASON_PRECHECK_SUCCEED: &str = "PreCheckSucceed";
const REASON_PRECHECK_FAILED: &str = "PreCheckFailed";

/// Resolves the cluster's topology and definitions
pub struct NormalizationTransformer;

#[async_trait]
impl Transformer for NormalizationTransformer {
    fn name(&self) -> &'static str {
        "normalization"
    }

    async fn transform(&self, ctx: &mut TransformContext) -> Result<()> {
        // The deletion order comes from the topology, so load it even when deleting
        load_cluster_definition(ctx).await?;
        if ctx.orig_cluster.is_deleting() {
            return Ok(());
        }

        match normalize(ctx).await {
            Ok(()) => {
                let message = format!(
                    "The operator has started the provisioning of Cluster: {}",
                    ctx.cluster_name()
                );
                set_cluster_condition(
                    ctx,
                    CONDITION_PROVISIONING_STARTED,
                    ConditionStatus::True,
                    REASON_PRECHECK_SUCCEED,
                    message,
                );
                Ok(())
            }
            Err(err) if err.is_premature_stop() || err.is_requeue() => Err(err),
            Err(err) => {
                set_cluster_condition(
                    ctx,
                    CONDITION_PROVISIONING_STARTED,
                    ConditionStatus::False,
                    REASON_PRECHECK_FAILED,
                    err.to_string(),
                );
                Err(err)
            }
        }
    }
}

async fn load_cluster_definition(ctx: &mut TransformContext) -> Result<()> {
    let name = ctx.cluster.spec.cluster_def.clone();
    if name.is_empty() {
        return Ok(());
    }
    let deleting = ctx.orig_cluster.is_deleting();
    let def = match ctx.store.get_cluster_definition(&name).await? {
        Some(def) => def,
        // deletion falls back to the unordered path
        None if deleting => return Ok(()),
        None => return Err(Error::not_found("ClusterDefinition", &name)),
    };
    if !deleting && !def.is_available() {
        return Err(Error::requeue(format!(
            "the referenced ClusterDefinition is unavailable: {}",
            name
        )));
    }
    ctx.cluster_def = Some(def);
    Ok(())
}

/// Definitions listed once per pass
struct Catalog {
    comp_defs: Vec<ComponentDefinition>,
    comp_versions: Vec<ComponentVersion>,
    sharding_defs: Vec<ShardingDefinition>,
}

impl Catalog {
    async fn load(ctx: &TransformContext, with_shardings: bool) -> Result<Self> {
        let sharding_defs = if with_shardings {
            ctx.store.list_sharding_definitions().await?
        } else {
            Vec::new()
        };
        Ok(Self {
            comp_defs: ctx.store.list_component_definitions().await?,
            comp_versions: ctx.store.list_component_versions().await?,
            sharding_defs,
        })
    }
}

async fn normalize(ctx: &mut TransformContext) -> Result<()> {
    let (components, shardings) = resolve_comps_and_shardings(ctx)?;
    ctx.components = components;
    ctx.shardings = shardings;

    let catalog = Catalog::load(ctx, !ctx.shardings.is_empty()).await?;
    resolve_sharding_definitions(ctx, &catalog).await?;
    resolve_component_definitions(ctx, &catalog).await?;
    check_crd_api_version(ctx)?;
    build_sharding_comps(ctx).await?;
    postcheck(ctx)?;
    write_back(ctx);

    debug!(
        cluster = %ctx.cluster_name(),
        components = ctx.components.len(),
        shardings = ctx.shardings.len(),
        "cluster resolved"
    );
    Ok(())
}

// =============================================================================
// Components and shardings
// =============================================================================

fn resolve_comps_and_shardings(
    ctx: &TransformContext,
) -> Result<(Vec<ClusterComponentSpec>, Vec<ClusterSharding>)> {
    let spec = &ctx.cluster.spec;
    if !spec.cluster_def.is_empty() {
        let topology = ctx.topology().ok_or_else(|| {
            Error::resolution_for(
                ctx.cluster_name(),
                format!("referred cluster topology not found : {}", spec.topology),
            )
        })?;
        return Ok((
            comps_from_topology(topology, &spec.component_specs),
            shardings_from_topology(topology, &spec.shardings),
        ));
    }
    Ok((spec.component_specs.clone(), spec.shardings.clone()))
}

/// Expand the topology's component slots
///
/// Plain slots always yield one spec; template slots only pick up the user's
/// specs whose names start with the slot name.
pub fn comps_from_topology(
    topology: &ClusterTopology,
    specified: &[ClusterComponentSpec],
) -> Vec<ClusterComponentSpec> {
    let mut result = Vec::new();
    for slot in &topology.components {
        let mut specs: Vec<ClusterComponentSpec> = specified
            .iter()
            .filter(|s| slot.matches(&s.name))
            .cloned()
            .collect();
        if specs.is_empty() && !slot.is_template() {
            specs.push(ClusterComponentSpec {
                name: slot.name.clone(),
                ..Default::default()
            });
        }
        for mut spec in specs {
            if spec.component_def.is_empty() {
                spec.component_def = slot.comp_def.clone();
            }
            result.push(spec);
        }
    }
    result
}

/// Expand the topology's sharding slots, merging the user's shardings by name
pub fn shardings_from_topology(
    topology: &ClusterTopology,
    specified: &[ClusterSharding],
) -> Vec<ClusterSharding> {
    topology
        .shardings
        .iter()
        .map(|slot| {
            let mut sharding = specified
                .iter()
                .find(|s| s.name == slot.name)
                .cloned()
                .unwrap_or_else(|| ClusterSharding {
                    name: slot.name.clone(),
                    ..Default::default()
                });
            if sharding.sharding_def.is_empty() {
                sharding.sharding_def = slot.sharding_def.clone();
            }
            sharding
        })
        .collect()
}

// =============================================================================
// Definition resolution
// =============================================================================

fn def_name<K: Resource>(def: &K) -> &str {
    def.meta().name.as_deref().unwrap_or_default()
}

/// Service versions a definition provides: its own plus every release of a
/// compatible ComponentVersion rule
fn service_versions_of(def: &ComponentDefinition, versions: &[ComponentVersion]) -> BTreeSet<String> {
    let mut result = BTreeSet::new();
    if !def.spec.service_version.is_empty() {
        result.insert(def.spec.service_version.clone());
    }
    for version in versions {
        let releases: BTreeSet<&str> = version
            .spec
            .compatibility_rules
            .iter()
            .filter(|rule| {
                rule.comp_defs
                    .iter()
                    .any(|pattern| prefix_or_regex_matched(def_name(def), pattern))
            })
            .flat_map(|rule| rule.releases.iter().map(String::as_str))
            .collect();
        for release in &version.spec.releases {
            if releases.contains(release.name.as_str()) {
                result.insert(release.service_version.clone());
            }
        }
    }
    result
}

/// Resolve a ComponentDefinition pattern and service version requirement
///
/// Candidates are the definitions named exactly `comp_def`, else those
/// matching it as a prefix or regex. The greatest version satisfying the
/// requirement wins, then the greatest definition name providing it.
pub fn resolve_comp_definition(
    defs: &[ComponentDefinition],
    versions: &[ComponentVersion],
    comp_def: &str,
    service_version: &str,
) -> Result<(ComponentDefinition, String)> {
    let candidates = filter_by_name_pattern(defs, comp_def, def_name::<ComponentDefinition>);

    // service version → definition names providing it
    let mut providers: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    for def in &candidates {
        for version in service_versions_of(def, versions) {
            if compare_service_version(service_version, &version)? {
                providers.entry(version).or_default().insert(def_name(*def));
            }
        }
    }

    let chosen = providers
        .keys()
        .max_by(|a, b| service_version_cmp(a, b))
        .cloned();
    let no_match = || {
        Error::resolution(format!(
            r#"no matched component definition found with componentDef "{}" and serviceVersion "{}""#,
            comp_def, service_version
        ))
    };
    let version = chosen.ok_or_else(no_match)?;
    let name = providers
        .get(&version)
        .and_then(|names| names.iter().next_back())
        .ok_or_else(no_match)?;
    let def = candidates
        .iter()
        .find(|d| def_name(**d) == *name)
        .map(|d| (*d).clone())
        .ok_or_else(no_match)?;
    Ok((def, version))
}

/// Resolve a ShardingDefinition pattern to the greatest matching name
pub fn resolve_sharding_definition(
    defs: &[ShardingDefinition],
    name: &str,
) -> Result<ShardingDefinition> {
    filter_by_name_pattern(defs, name, def_name::<ShardingDefinition>)
        .into_iter()
        .max_by(|a, b| def_name(*a).cmp(def_name(*b)))
        .cloned()
        .ok_or_else(|| {
            Error::resolution(format!(
                "no sharding definition found for the specified name: {}",
                name
            ))
        })
}

/// Resolve against the spec on first creation or when the spec asks for a
/// different definition or version, else against what is running
fn resolve_with_running(
    catalog: &Catalog,
    comp_def: &str,
    service_version: &str,
    running: Option<&Component>,
) -> Result<(ComponentDefinition, String)> {
    let running = running.map(|c| (c.spec.comp_def.as_str(), c.spec.service_version.as_str()));
    resolve_pinned(catalog, comp_def, service_version, running)
}

/// `running` is the `(comp_def, service_version)` pair currently deployed
fn resolve_pinned(
    catalog: &Catalog,
    comp_def: &str,
    service_version: &str,
    running: Option<(&str, &str)>,
) -> Result<(ComponentDefinition, String)> {
    let (comp_def, service_version) = match running {
        Some((running_def, running_version))
            if running_def == comp_def && running_version == service_version =>
        {
            (running_def, running_version)
        }
        _ => (comp_def, service_version),
    };
    resolve_comp_definition(
        &catalog.comp_defs,
        &catalog.comp_versions,
        comp_def,
        service_version,
    )
}

/// Resolve the instance templates of `spec` that override the definition
/// or the version
///
/// A template inherits the component's resolved values for whatever it
/// leaves empty and stays on the running template's values unless either
/// changed.
fn resolve_instance_templates(
    catalog: &Catalog,
    spec: &mut ClusterComponentSpec,
    running: Option<&Component>,
) -> Result<Vec<ComponentDefinition>> {
    let mut resolved_defs = Vec::new();
    for tpl in spec.instances.iter_mut() {
        let own_def = tpl.comp_def.clone().filter(|s| !s.is_empty());
        let own_version = tpl.service_version.clone().filter(|s| !s.is_empty());
        if own_def.is_none() && own_version.is_none() {
            continue;
        }
        let comp_def = own_def.unwrap_or_else(|| spec.component_def.clone());
        let service_version = own_version.unwrap_or_else(|| spec.service_version.clone());

        let running_tpl = running
            .and_then(|c| c.spec.instances.iter().find(|t| t.name == tpl.name))
            .map(|t| {
                (
                    t.comp_def.as_deref().unwrap_or_default(),
                    t.service_version.as_deref().unwrap_or_default(),
                )
            });
        let (def, version) = resolve_pinned(catalog, &comp_def, &service_version, running_tpl)?;

        tpl.comp_def = Some(def.name_any());
        tpl.service_version = Some(version);
        resolved_defs.push(def);
    }
    Ok(resolved_defs)
}

/// One shard template of a sharding to resolve; `index` is `None` for the default
struct TemplateToResolve {
    name: String,
    index: Option<usize>,
    sharding_def: String,
    comp_def: String,
    service_version: String,
}

fn templates_to_resolve(sharding: &ClusterSharding) -> Vec<TemplateToResolve> {
    let mut result = vec![TemplateToResolve {
        name: String::new(),
        index: None,
        sharding_def: sharding.sharding_def.clone(),
        comp_def: sharding.template.component_def.clone(),
        service_version: sharding.template.service_version.clone(),
    }];
    for (i, tpl) in sharding.shard_templates.iter().enumerate() {
        let sharding_def = tpl
            .sharding_def
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| sharding.sharding_def.clone());
        let overridden = tpl.comp_def.as_deref().is_some_and(|s| !s.is_empty())
            || tpl.service_version.as_deref().is_some_and(|s| !s.is_empty());
        let (comp_def, service_version) = if overridden {
            (
                tpl.comp_def.clone().unwrap_or_default(),
                tpl.service_version.clone().unwrap_or_default(),
            )
        } else {
            (
                sharding.template.component_def.clone(),
                sharding.template.service_version.clone(),
            )
        };
        result.push(TemplateToResolve {
            name: tpl.name.clone(),
            index: Some(i),
            sharding_def,
            comp_def,
            service_version,
        });
    }
    result
}

/// One running shard built from the template, if any
async fn first_shard(
    ctx: &TransformContext,
    sharding: &str,
    template: &str,
) -> Result<Option<Component>> {
    let mut labels = BTreeMap::from([
        (APP_INSTANCE_LABEL.to_string(), ctx.cluster_name()),
        (SHARDING_NAME_LABEL.to_string(), sharding.to_string()),
    ]);
    if !template.is_empty() {
        labels.insert(SHARD_TEMPLATE_LABEL.to_string(), template.to_string());
    }
    let mut shards = ctx.store.list_components(&ctx.namespace(), &labels).await?;
    shards.sort_by_key(|c| c.name_any());
    Ok(shards.into_iter().next())
}

async fn resolve_sharding_definitions(ctx: &mut TransformContext, catalog: &Catalog) -> Result<()> {
    for i in 0..ctx.shardings.len() {
        let sharding_name = ctx.shardings[i].name.clone();
        for tpl in templates_to_resolve(&ctx.shardings[i]) {
            let running = first_shard(ctx, &sharding_name, &tpl.name).await?;

            // A running shard keeps the ShardingDefinition it was built from
            let sharding_def_name = running
                .as_ref()
                .and_then(|c| c.label(SHARDING_DEF_LABEL))
                .map(str::to_string)
                .unwrap_or(tpl.sharding_def.clone());

            let mut comp_def = tpl.comp_def.clone();
            let mut sharding_def = None;
            if !sharding_def_name.is_empty() {
                let def = resolve_sharding_definition(&catalog.sharding_defs, &sharding_def_name)?;
                if comp_def.is_empty() {
                    comp_def = def.spec.template.comp_def.clone();
                }
                sharding_def = Some(def);
            }

            let (resolved, version) =
                resolve_with_running(catalog, &comp_def, &tpl.service_version, running.as_ref())?;

            let sharding = &mut ctx.shardings[i];
            if let Some(def) = sharding_def {
                let name = def.name_any();
                match tpl.index {
                    None => sharding.sharding_def = name.clone(),
                    Some(j) => sharding.shard_templates[j].sharding_def = Some(name.clone()),
                }
                ctx.sharding_defs.insert(name, def);
            }
            let resolved_name = resolved.name_any();
            match tpl.index {
                None => {
                    sharding.template.component_def = resolved_name.clone();
                    sharding.template.service_version = version;
                }
                Some(j) => {
                    sharding.shard_templates[j].comp_def = Some(resolved_name.clone());
                    sharding.shard_templates[j].service_version = Some(version);
                }
            }
            ctx.component_defs.insert(resolved_name, resolved);
        }
    }
    Ok(())
}

async fn resolve_component_definitions(
    ctx: &mut TransformContext,
    catalog: &Catalog,
) -> Result<()> {
    let cluster_name = ctx.cluster_name();
    let namespace = ctx.namespace();
    for i in 0..ctx.components.len() {
        let full_name = component_full_name(&cluster_name, &ctx.components[i].name);
        let running = ctx.store.get_component(&namespace, &full_name).await?;

        let spec = &ctx.components[i];
        let (resolved, version) = resolve_with_running(
            catalog,
            &spec.component_def,
            &spec.service_version,
            running.as_ref(),
        )?;

        let spec = &mut ctx.components[i];
        spec.component_def = resolved.name_any();
        spec.service_version = version;
        ctx.component_defs.insert(resolved.name_any(), resolved);

        let template_defs = resolve_instance_templates(catalog, spec, running.as_ref())?;
        for def in template_defs {
            ctx.component_defs.insert(def.name_any(), def);
        }
    }
    Ok(())
}

// =============================================================================
// CRD API version
// =============================================================================

fn is_api_version_supported(version: &str) -> bool {
    version.is_empty() || version == APPS_API_VERSION
}

/// Adopt the CRD API version of the referenced definitions
///
/// The value is recorded on the cluster. Clusters written for another API
/// version are left to the controller of that version.
fn check_crd_api_version(ctx: &mut TransformContext) -> Result<()> {
    let mut version = ctx
        .cluster
        .annotation(CRD_API_VERSION_ANNOTATION)
        .unwrap_or_default()
        .to_string();

    if version.is_empty() {
        // annotation value → definitions carrying it
        let mut found: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut record = |name: String, annotations: &BTreeMap<String, String>| {
            let value = annotations
                .get(CRD_API_VERSION_ANNOTATION)
                .cloned()
                .unwrap_or_default();
            found.entry(value).or_default().push(name);
        };
        match &ctx.cluster_def {
            Some(def) => record(def.name_any(), def.annotations()),
            None => {
                for def in ctx.component_defs.values() {
                    record(def.name_any(), def.annotations());
                }
                for def in ctx.sharding_defs.values() {
                    record(def.name_any(), def.annotations());
                }
            }
        }
        if found.len() > 1 {
            return Err(Error::resolution_for(
                ctx.cluster_name(),
                format!("multiple CRD API versions found: {:?}", found),
            ));
        }
        version = found.into_keys().next().unwrap_or_default();
    }

    ctx.cluster
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(CRD_API_VERSION_ANNOTATION.to_string(), version.clone());

    if is_api_version_supported(&version) {
        return Ok(());
    }
    info!(cluster = %ctx.cluster_name(), api_version = %version, "cluster belongs to another API version, skipping");
    Err(Error::PrematureStop)
}

// =============================================================================
// Shards, checks and write-back
// =============================================================================

async fn build_sharding_comps(ctx: &mut TransformContext) -> Result<()> {
    let cluster_name = ctx.cluster_name();
    let namespace = ctx.namespace();
    for i in 0..ctx.shardings.len() {
        let name = ctx.shardings[i].name.clone();
        let labels = BTreeMap::from([
            (APP_INSTANCE_LABEL.to_string(), cluster_name.clone()),
            (SHARDING_NAME_LABEL.to_string(), name.clone()),
        ]);
        let running = ctx.store.list_components(&namespace, &labels).await?;
        let by_template =
            build_sharding_comp_specs(&cluster_name, &ctx.shardings[i], &running, &mut ctx.rng)?;
        ctx.sharding_comps
            .insert(name.clone(), flatten_shard_specs(&by_template));
        ctx.sharding_comps_with_tpl.insert(name, by_template);
    }
    Ok(())
}

fn postcheck(ctx: &TransformContext) -> Result<()> {
    let names: BTreeSet<&str> = ctx.components.iter().map(|c| c.name.as_str()).collect();
    for sharding in &ctx.shardings {
        if names.contains(sharding.name.as_str()) {
            return Err(Error::validation_for(
                ctx.cluster_name(),
                format!(
                    r#"duplicate name "{}" between spec.compSpecs and spec.shardings"#,
                    sharding.name
                ),
            ));
        }
    }

    for (i, sharding) in ctx.shardings.iter().enumerate() {
        let Some(limit) = ctx
            .sharding_defs
            .get(&sharding.sharding_def)
            .and_then(|d| d.spec.shards_limit)
        else {
            continue;
        };
        if sharding.shards < limit.min_shards || sharding.shards > limit.max_shards {
            return Err(Error::validation_for_field(
                ctx.cluster_name(),
                format!("spec.shardings[{}].shards", i),
                format!(
                    "shards {} out-of-limit [{}, {}], sharding: {}",
                    sharding.shards, limit.min_shards, limit.max_shards, sharding.name
                ),
            ));
        }
    }
    Ok(())
}

fn write_back(ctx: &mut TransformContext) {
    if !ctx.components.is_empty() {
        ctx.cluster.spec.component_specs = ctx.components.clone();
    }
    if !ctx.shardings.is_empty() {
        ctx.cluster.spec.shardings = ctx.shardings.clone();
    }
}
