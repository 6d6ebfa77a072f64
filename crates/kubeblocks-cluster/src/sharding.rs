//! Shard materialization
//!
//! A sharding expands into one component spec per shard. Shards are named
//! `<sharding>-<id>` with a random three character id that stays stable for
//! the life of the shard. Each shard belongs to exactly one shard template;
//! the unnamed default template takes whatever the named templates leave.

use std::collections::{BTreeMap, BTreeSet};

use kube::ResourceExt;
use rand::Rng;
use tracing::debug;

use kubeblocks_common::constants::SHARD_TEMPLATE_LABEL;
use kubeblocks_common::crd::{ClusterComponentSpec, ClusterSharding, Component, ShardTemplate};
use kubeblocks_common::{Error, Result};

/// Name of the default shard template
pub const DEFAULT_SHARD_TEMPLATE: &str = "";

/// Characters shard ids are drawn from; no vowels, no look-alikes
const ID_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const ID_LENGTH: usize = 3;
const MAX_ALLOCATE_ATTEMPTS: usize = 1_000_000;

/// Allocates shard ids that collide with nothing already in use
pub struct ShardIdGenerator<'a, R: Rng> {
    rng: &'a mut R,
    used: BTreeSet<String>,
}

impl<'a, R: Rng> ShardIdGenerator<'a, R> {
    /// Create a generator that avoids `used`
    pub fn new(rng: &'a mut R, used: BTreeSet<String>) -> Self {
        Self { rng, used }
    }

    /// Draw a fresh id and mark it used
    pub fn allocate(&mut self) -> Result<String> {
        for _ in 0..MAX_ALLOCATE_ATTEMPTS {
            let id: String = (0..ID_LENGTH)
                .map(|_| ID_ALPHABET[self.rng.gen_range(0..ID_ALPHABET.len())] as char)
                .collect();
            if self.used.insert(id.clone()) {
                return Ok(id);
            }
        }
        Err(Error::internal_with_context(
            "sharding",
            format!("no free shard id after {} attempts", MAX_ALLOCATE_ATTEMPTS),
        ))
    }
}

fn shard_prefix(cluster: &str, sharding: &str) -> String {
    format!("{}-{}-", cluster, sharding)
}

fn shard_id_of(cluster: &str, sharding: &str, full_name: &str) -> String {
    let prefix = shard_prefix(cluster, sharding);
    full_name
        .strip_prefix(&prefix)
        .unwrap_or(full_name)
        .to_string()
}

fn precheck(sharding: &ClusterSharding) -> Result<()> {
    let declared: i32 = sharding
        .shard_templates
        .iter()
        .map(ShardTemplate::shard_count)
        .sum();
    if declared > sharding.shards {
        return Err(Error::validation_for_field(
            &sharding.name,
            "shardTemplates",
            "the sum of shards in shard templates is greater than the total shards",
        ));
    }

    let mut seen = BTreeSet::new();
    for id in sharding.shard_templates.iter().flat_map(|t| t.shard_ids.iter()) {
        if !seen.insert(id.as_str()) {
            return Err(Error::validation_for_field(
                &sharding.name,
                "shardTemplates.shardIDs",
                format!("shard id {} is duplicated", id),
            ));
        }
    }
    Ok(())
}

/// Merge a shard template's overrides onto the sharding's default template
pub fn merge_shard_template(base: &ClusterComponentSpec, tpl: &ShardTemplate) -> ClusterComponentSpec {
    let mut spec = base.clone();
    if let Some(comp_def) = tpl.comp_def.as_ref().filter(|s| !s.is_empty()) {
        spec.component_def = comp_def.clone();
    }
    if let Some(version) = tpl.service_version.as_ref().filter(|s| !s.is_empty()) {
        spec.service_version = version.clone();
    }
    if let Some(replicas) = tpl.replicas {
        spec.replicas = replicas;
    }
    spec.labels.extend(tpl.labels.clone());
    spec.annotations.extend(tpl.annotations.clone());
    for env in &tpl.env {
        match spec.env.iter_mut().find(|e| e.name == env.name) {
            Some(existing) => *existing = env.clone(),
            None => spec.env.push(env.clone()),
        }
    }
    if let Some(policy) = &tpl.scheduling_policy {
        spec.scheduling_policy = Some(policy.clone());
    }
    if let Some(resources) = &tpl.resources {
        spec.resources = resources.clone();
    }
    if !tpl.volume_claim_templates.is_empty() {
        spec.volume_claim_templates = tpl.volume_claim_templates.clone();
    }
    spec
}

/// Expand a sharding into per-shard component specs, keyed by shard template
///
/// `running` holds the sharding's existing shard Components. Existing shards
/// are kept where possible: per template the lexicographically first ones
/// survive a scale-in, and a scale-out allocates new ids. Offline shards are
/// never kept and their ids are never reused. The default template is always
/// present in the result, possibly empty.
pub fn build_sharding_comp_specs<R: Rng>(
    cluster: &str,
    sharding: &ClusterSharding,
    running: &[Component],
    rng: &mut R,
) -> Result<BTreeMap<String, Vec<ClusterComponentSpec>>> {
    precheck(sharding)?;

    let offline: BTreeSet<&str> = sharding.offline.iter().map(String::as_str).collect();
    let declared: i32 = sharding
        .shard_templates
        .iter()
        .map(ShardTemplate::shard_count)
        .sum();

    // template name → (wanted count, existing ids)
    let mut templates: Vec<(&str, usize, Vec<String>)> = Vec::new();
    templates.push((
        DEFAULT_SHARD_TEMPLATE,
        (sharding.shards - declared).max(0) as usize,
        Vec::new(),
    ));
    for tpl in &sharding.shard_templates {
        templates.push((tpl.name.as_str(), tpl.shard_count().max(0) as usize, Vec::new()));
    }

    let mut used: BTreeSet<String> = BTreeSet::new();
    for name in &sharding.offline {
        used.insert(shard_id_of(cluster, &sharding.name, name));
    }
    for id in sharding.shard_templates.iter().flat_map(|t| t.shard_ids.iter()) {
        used.insert(id.clone());
    }

    let mut sorted: Vec<&Component> = running.iter().collect();
    sorted.sort_by_key(|c| c.name_any());
    for comp in sorted {
        let full_name = comp.name_any();
        let id = shard_id_of(cluster, &sharding.name, &full_name);
        used.insert(id.clone());
        if offline.contains(full_name.as_str()) {
            continue;
        }

        let owner = sharding
            .shard_templates
            .iter()
            .find(|t| t.shard_ids.contains(&id))
            .map(|t| t.name.as_str())
            .unwrap_or_else(|| comp.label(SHARD_TEMPLATE_LABEL).unwrap_or(DEFAULT_SHARD_TEMPLATE));

        match templates.iter_mut().find(|(name, _, _)| *name == owner) {
            Some((_, _, ids)) => ids.push(id),
            None => debug!(shard = %full_name, template = %owner, "dropping shard of a removed template"),
        }
    }

    let mut generator = ShardIdGenerator::new(rng, used);
    let mut result = BTreeMap::new();
    for (name, count, mut ids) in templates {
        ids.truncate(count);
        if ids.len() < count {
            if let Some(tpl) = sharding.shard_templates.iter().find(|t| t.name == name) {
                for id in &tpl.shard_ids {
                    if ids.len() < count && !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
            }
        }
        while ids.len() < count {
            ids.push(generator.allocate()?);
        }

        let base = match sharding.shard_templates.iter().find(|t| t.name == name) {
            Some(tpl) => merge_shard_template(&sharding.template, tpl),
            None => sharding.template.clone(),
        };
        let mut specs: Vec<ClusterComponentSpec> = ids
            .into_iter()
            .map(|id| {
                let mut spec = base.clone();
                spec.name = format!("{}-{}", sharding.name, id);
                spec
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        result.insert(name.to_string(), specs);
    }
    Ok(result)
}

/// Flatten per-template shard specs into one list sorted by name
pub fn flatten_shard_specs(
    by_template: &BTreeMap<String, Vec<ClusterComponentSpec>>,
) -> Vec<ClusterComponentSpec> {
    let mut specs: Vec<ClusterComponentSpec> = by_template.values().flatten().cloned().collect();
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    specs
}
