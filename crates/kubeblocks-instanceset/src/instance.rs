//! Instance naming, template merging and object building
//!
//! An instance is one pod plus its volume claims. Every instance is built
//! from a [`MergedTemplate`]: the set's base pod template with one
//! [`InstanceTemplate`] override applied. Instances not covered by an
//! override come from an implicit default template with an empty name.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapEnvSource, EnvFromSource, PersistentVolumeClaim,
    PersistentVolumeClaimVolumeSource, Pod, PodTemplateSpec, ResourceRequirements, Service,
    Volume,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use kubeblocks_common::constants::{
    APP_MANAGED_BY_LABEL, APP_MANAGED_BY_VALUE, INSTANCE_SET_NAME_LABEL, INSTANCE_TEMPLATE_LABEL,
    POD_NAME_LABEL, POD_SPEC_HASH_ANNOTATION, REVISION_LABEL, RSM_NAME_LABEL,
    VOLUME_CLAIM_TEMPLATE_LABEL, WORKLOADS_API_VERSION,
};
use kubeblocks_common::crd::{AccessMode, InstanceSet, InstanceTemplate, ReplicaRole};
use kubeblocks_common::events::{actions, reasons};
use kubeblocks_common::quantity::storage_grew;
use kubeblocks_common::{Error, OperatorConfig, Result};

use crate::in_place::pod_spec_hash;
use crate::revision::build_template_revision;
use crate::tree::ObjectTree;

// =============================================================================
// Role priorities
// =============================================================================

/// Priority of the leader role; it is updated last
pub const LEADER_PRIORITY: i32 = 1 << 5;
/// Voting followers with read-write access
pub const FOLLOWER_READ_WRITE_PRIORITY: i32 = 1 << 4;
/// Voting followers with read-only access
pub const FOLLOWER_READONLY_PRIORITY: i32 = 1 << 3;
/// Voting followers without client access
pub const FOLLOWER_NONE_PRIORITY: i32 = 1 << 2;
/// Non-voting members
pub const LEARNER_PRIORITY: i32 = 1 << 1;
/// Pods without a role label
pub const EMPTY_PRIORITY: i32 = 1;
/// Pods whose role is not declared
pub const UNKNOWN_PRIORITY: i32 = 0;

/// Map of lower-cased role name to update priority
pub fn role_priorities(roles: &[ReplicaRole]) -> BTreeMap<String, i32> {
    let mut priorities = BTreeMap::from([(String::new(), EMPTY_PRIORITY)]);
    for role in roles {
        let priority = if role.is_leader {
            LEADER_PRIORITY
        } else if !role.can_vote {
            LEARNER_PRIORITY
        } else {
            match role.access_mode {
                AccessMode::ReadWrite => FOLLOWER_READ_WRITE_PRIORITY,
                AccessMode::Readonly => FOLLOWER_READONLY_PRIORITY,
                AccessMode::None => FOLLOWER_NONE_PRIORITY,
            }
        };
        priorities.insert(role.name.to_lowercase(), priority);
    }
    priorities
}

/// Priority of a role name, unknown roles rank lowest
pub fn priority_of(priorities: &BTreeMap<String, i32>, role: &str) -> i32 {
    priorities
        .get(&role.to_lowercase())
        .copied()
        .unwrap_or(UNKNOWN_PRIORITY)
}

// =============================================================================
// Names
// =============================================================================

/// Split an instance name into its parent and ordinal
///
/// `its-big-3` parses as `("its-big", 3)`. A name without a numeric suffix
/// is its own parent with ordinal -1.
pub fn parse_parent_name_and_ordinal(name: &str) -> (String, i32) {
    if let Some((parent, suffix)) = name.rsplit_once('-') {
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(ordinal) = suffix.parse::<i32>() {
                return (parent.to_string(), ordinal);
            }
        }
    }
    (name.to_string(), -1)
}

/// Order items by role priority ascending, then by parent name and ordinal
/// descending
///
/// The forward order is the order pods are scaled in and updated: unknown
/// and empty roles first, the leader last, higher ordinals before lower ones.
/// `reverse` gives the display order used in status.
pub fn sort_by_role_and_name<T>(
    items: &mut [T],
    name_of: impl Fn(&T) -> String,
    priority_of: impl Fn(&T) -> i32,
    reverse: bool,
) {
    items.sort_by(|a, b| {
        let ord = priority_of(a).cmp(&priority_of(b)).then_with(|| {
            let (parent_a, ordinal_a) = parse_parent_name_and_ordinal(&name_of(a));
            let (parent_b, ordinal_b) = parse_parent_name_and_ordinal(&name_of(b));
            parent_b.cmp(&parent_a).then(ordinal_b.cmp(&ordinal_a))
        });
        if reverse {
            ord.reverse()
        } else {
            ord
        }
    });
}

/// Sort pods by their role label and name
pub fn sort_pods(pods: &mut [&Pod], priorities: &BTreeMap<String, i32>, reverse: bool) {
    sort_by_role_and_name(
        pods,
        |p| p.name_any(),
        |p| priority_of(priorities, &crate::pod::role(p)),
        reverse,
    );
}

/// Names of one template's instances
///
/// The default template (empty name) yields `<parent>-<ordinal>`, a named one
/// `<parent>-<template>-<ordinal>`. Ordinals count up from `ordinal_start`
/// and skip offline names.
pub fn generate_instance_names(
    parent: &str,
    template_name: &str,
    replicas: i32,
    ordinal_start: i32,
    offline: &BTreeSet<&str>,
) -> Vec<String> {
    let prefix = if template_name.is_empty() {
        parent.to_string()
    } else {
        format!("{}-{}", parent, template_name)
    };
    let wanted = usize::try_from(replicas).unwrap_or(0);
    let mut names = Vec::with_capacity(wanted);
    let mut ordinal = ordinal_start;
    while names.len() < wanted {
        let name = format!("{}-{}", prefix, ordinal);
        ordinal += 1;
        if !offline.contains(name.as_str()) {
            names.push(name);
        }
    }
    names
}

/// Reject repeated names, listing each duplicate once
pub fn validate_duplicate_names<'a>(names: impl IntoIterator<Item = &'a String>) -> Result<()> {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            duplicates.insert(name.as_str());
        }
    }
    if duplicates.is_empty() {
        return Ok(());
    }
    let listed: String = duplicates.iter().map(|n| format!("{},", n)).collect();
    Err(Error::validation(format!("duplicate pod names: {}", listed)))
}

/// Every instance name of the set, in template order
pub fn generate_all_instance_names(its: &InstanceSet) -> Result<Vec<String>> {
    let parent = its.name_any();
    let offline: BTreeSet<&str> = its.spec.offline_instances.iter().map(String::as_str).collect();
    let names: Vec<String> = build_instance_templates(its)
        .iter()
        .flat_map(|t| {
            generate_instance_names(
                &parent,
                &t.name,
                t.replica_count(),
                t.ordinal_start.unwrap_or(0),
                &offline,
            )
        })
        .collect();
    validate_duplicate_names(&names)?;
    Ok(names)
}

// =============================================================================
// Templates
// =============================================================================

/// Name of the headless service governing the pods
pub fn headless_service_name(its: &InstanceSet) -> String {
    if its.spec.service_name.is_empty() {
        format!("{}-headless", its.name_any())
    } else {
        its.spec.service_name.clone()
    }
}

/// Name of the config map holding the set's environment
pub fn env_config_map_name(its_name: &str) -> String {
    format!("{}-env", its_name)
}

/// Labels selecting the set's pods and assistant objects
pub fn match_labels(its: &InstanceSet) -> BTreeMap<String, String> {
    let mut labels = its.spec.selector.match_labels.clone().unwrap_or_default();
    labels.insert(APP_MANAGED_BY_LABEL.to_string(), APP_MANAGED_BY_VALUE.to_string());
    labels.insert(INSTANCE_SET_NAME_LABEL.to_string(), its.name_any());
    labels
}

/// Controller reference to the set, so deleting it cascades
pub fn owner_reference(its: &InstanceSet) -> OwnerReference {
    OwnerReference {
        api_version: WORKLOADS_API_VERSION.to_string(),
        kind: "InstanceSet".to_string(),
        name: its.name_any(),
        uid: its.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Spec overrides plus an implicit default template for the remainder
pub fn build_instance_templates(its: &InstanceSet) -> Vec<InstanceTemplate> {
    let mut templates = its.spec.instances.clone();
    let in_templates: i32 = templates.iter().map(InstanceTemplate::replica_count).sum();
    if in_templates < its.spec.replicas {
        templates.push(InstanceTemplate {
            replicas: Some(its.spec.replicas - in_templates),
            ..Default::default()
        });
    }
    templates
}

/// An instance template with the base pod template merged in
#[derive(Clone, Debug, PartialEq)]
pub struct MergedTemplate {
    /// Template name, empty for the default template
    pub name: String,
    /// Instances built from it
    pub replicas: i32,
    /// First ordinal
    pub ordinal_start: i32,
    /// Fully merged pod template
    pub pod_template: PodTemplateSpec,
    /// Fully merged claim templates
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
    /// Revision of `pod_template`
    pub revision: String,
    /// Hash of `pod_template` without its in-place updatable fields
    pub spec_hash: String,
}

/// The set's pod template with the env config map wired into every container
pub fn base_pod_template(its: &InstanceSet) -> PodTemplateSpec {
    let mut template = its.spec.template.clone();
    let env_source = EnvFromSource {
        config_map_ref: Some(ConfigMapEnvSource {
            name: env_config_map_name(&its.name_any()),
            optional: Some(false),
        }),
        ..Default::default()
    };
    if let Some(spec) = template.spec.as_mut() {
        for container in &mut spec.containers {
            container
                .env_from
                .get_or_insert_with(Vec::new)
                .push(env_source.clone());
        }
    }
    template
}

/// Replace items matching by `same`, append the rest
fn merge_list<T: Clone>(src: &[T], dst: &mut Vec<T>, same: impl Fn(&T, &T) -> bool) {
    for item in src {
        match dst.iter_mut().find(|d| same(item, d)) {
            Some(existing) => *existing = item.clone(),
            None => dst.push(item.clone()),
        }
    }
}

fn append_unique<T: Clone + PartialEq>(src: Option<&Vec<T>>, dst: &mut Option<Vec<T>>) {
    let Some(src) = src else { return };
    let dst = dst.get_or_insert_with(Vec::new);
    for item in src {
        if !dst.contains(item) {
            dst.push(item.clone());
        }
    }
}

fn merge_map(src: &BTreeMap<String, String>, dst: &mut Option<BTreeMap<String, String>>) {
    if src.is_empty() {
        return;
    }
    let dst = dst.get_or_insert_with(BTreeMap::new);
    for (k, v) in src {
        dst.insert(k.clone(), v.clone());
    }
}

fn merge_cpu_and_memory(
    src: Option<&BTreeMap<String, Quantity>>,
    dst: &mut Option<BTreeMap<String, Quantity>>,
) {
    let Some(src) = src else { return };
    for key in ["cpu", "memory"] {
        if let Some(value) = src.get(key) {
            dst.get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.clone());
        }
    }
}

fn merge_resources(src: &ResourceRequirements, dst: &mut ResourceRequirements) {
    merge_cpu_and_memory(src.limits.as_ref(), &mut dst.limits);
    merge_cpu_and_memory(src.requests.as_ref(), &mut dst.requests);
}

fn merge_affinity(src: &Affinity, dst: &mut Option<Affinity>) {
    let dst = dst.get_or_insert_with(Affinity::default);
    if let Some(src) = &src.pod_affinity {
        let dst = dst.pod_affinity.get_or_insert_with(Default::default);
        append_unique(
            src.required_during_scheduling_ignored_during_execution.as_ref(),
            &mut dst.required_during_scheduling_ignored_during_execution,
        );
        append_unique(
            src.preferred_during_scheduling_ignored_during_execution.as_ref(),
            &mut dst.preferred_during_scheduling_ignored_during_execution,
        );
    }
    if let Some(src) = &src.pod_anti_affinity {
        let dst = dst.pod_anti_affinity.get_or_insert_with(Default::default);
        append_unique(
            src.required_during_scheduling_ignored_during_execution.as_ref(),
            &mut dst.required_during_scheduling_ignored_during_execution,
        );
        append_unique(
            src.preferred_during_scheduling_ignored_during_execution.as_ref(),
            &mut dst.preferred_during_scheduling_ignored_during_execution,
        );
    }
    if let Some(src) = &src.node_affinity {
        let dst = dst.node_affinity.get_or_insert_with(Default::default);
        if let Some(required) = &src.required_during_scheduling_ignored_during_execution {
            let terms = &mut dst
                .required_during_scheduling_ignored_during_execution
                .get_or_insert_with(Default::default)
                .node_selector_terms;
            for term in &required.node_selector_terms {
                if !terms.contains(term) {
                    terms.push(term.clone());
                }
            }
        }
        append_unique(
            src.preferred_during_scheduling_ignored_during_execution.as_ref(),
            &mut dst.preferred_during_scheduling_ignored_during_execution,
        );
    }
}

/// Apply one override to the base template
///
/// Labels, annotations and node selectors are merged with the override
/// winning. Image, CPU/memory, env and volume mounts go to the first
/// container. Tolerations, spread constraints and affinity terms are
/// appended. Volumes and claim templates are merged by name.
pub fn merge_template(its: &InstanceSet, template: &InstanceTemplate, config: &OperatorConfig) -> Result<MergedTemplate> {
    let mut pod_template = base_pod_template(its);
    let mut claims = its.spec.volume_claim_templates.clone();

    let meta = pod_template.metadata.get_or_insert_with(ObjectMeta::default);
    merge_map(&template.annotations, &mut meta.annotations);
    merge_map(&template.labels, &mut meta.labels);

    let spec = pod_template.spec.get_or_insert_with(Default::default);
    if let Some(policy) = &template.scheduling_policy {
        if let Some(node_name) = policy.node_name.as_ref().filter(|n| !n.is_empty()) {
            spec.node_name = Some(node_name.clone());
        }
        if let Some(scheduler) = &policy.scheduler_name {
            spec.scheduler_name = Some(scheduler.clone());
        }
        merge_map(&policy.node_selector, &mut spec.node_selector);
        append_unique(Some(&policy.tolerations), &mut spec.tolerations);
        append_unique(
            Some(&policy.topology_spread_constraints),
            &mut spec.topology_spread_constraints,
        );
        if let Some(affinity) = &policy.affinity {
            merge_affinity(affinity, &mut spec.affinity);
        }
    }
    if let Some(first) = spec.containers.first_mut() {
        if let Some(image) = &template.image {
            first.image = Some(image.clone());
        }
        if let Some(resources) = &template.resources {
            merge_resources(resources, first.resources.get_or_insert_with(Default::default));
        }
        if !template.env.is_empty() {
            merge_list(&template.env, first.env.get_or_insert_with(Vec::new), |a, b| {
                a.name == b.name
            });
        }
        if !template.volume_mounts.is_empty() {
            merge_list(
                &template.volume_mounts,
                first.volume_mounts.get_or_insert_with(Vec::new),
                |a, b| a.name == b.name,
            );
        }
    }
    if !template.volumes.is_empty() {
        merge_list(&template.volumes, spec.volumes.get_or_insert_with(Vec::new), |a, b| {
            a.name == b.name
        });
    }
    merge_list(&template.volume_claim_templates, &mut claims, |a, b| {
        a.metadata.name == b.metadata.name
    });

    let revision = build_template_revision(&pod_template, config)?;
    let spec_hash = pod_spec_hash(&pod_template, config)?;
    Ok(MergedTemplate {
        name: template.name.clone(),
        replicas: template.replica_count(),
        ordinal_start: template.ordinal_start.unwrap_or(0),
        pod_template,
        volume_claim_templates: claims,
        revision,
        spec_hash,
    })
}

/// Merged templates and the instance names each one owns
#[derive(Clone, Debug)]
pub struct InstanceSetExt {
    /// Merged templates in spec order, the default template last
    pub templates: Vec<MergedTemplate>,
    names: BTreeMap<String, usize>,
}

impl InstanceSetExt {
    /// Merge every template and generate every instance name
    pub fn build(its: &InstanceSet, config: &OperatorConfig) -> Result<Self> {
        let parent = its.name_any();
        let offline: BTreeSet<&str> =
            its.spec.offline_instances.iter().map(String::as_str).collect();
        let mut templates = Vec::new();
        let mut all_names = Vec::new();
        let mut names = BTreeMap::new();
        for (index, template) in build_instance_templates(its).iter().enumerate() {
            let merged = merge_template(its, template, config)?;
            for name in generate_instance_names(
                &parent,
                &merged.name,
                merged.replicas,
                merged.ordinal_start,
                &offline,
            ) {
                names.insert(name.clone(), index);
                all_names.push(name);
            }
            templates.push(merged);
        }
        validate_duplicate_names(&all_names)?;
        Ok(Self { templates, names })
    }

    /// Desired instance names, ordered by name
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.names.keys()
    }

    /// True if `name` is a desired instance
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Template an instance is built from
    pub fn template_of(&self, name: &str) -> Option<&MergedTemplate> {
        self.names.get(name).and_then(|i| self.templates.get(*i))
    }

    /// Instance name → desired revision
    pub fn revisions(&self) -> BTreeMap<String, String> {
        self.names
            .iter()
            .filter_map(|(name, i)| {
                self.templates
                    .get(*i)
                    .map(|t| (name.clone(), t.revision.clone()))
            })
            .collect()
    }
}

// =============================================================================
// Building
// =============================================================================

fn pvc_name(claim_template: &str, pod_name: &str) -> String {
    format!("{}-{}", claim_template, pod_name)
}

/// Build the pod of instance `name`
///
/// Hostname and subdomain are set here; the API server rejects later
/// changes to them.
pub fn build_pod(its: &InstanceSet, name: &str, template: &MergedTemplate, config: &OperatorConfig) -> Pod {
    let template_meta = template.pod_template.metadata.clone().unwrap_or_default();

    let mut labels = template_meta.labels.unwrap_or_default();
    labels.extend(match_labels(its));
    labels.insert(REVISION_LABEL.to_string(), template.revision.clone());
    labels.insert(POD_NAME_LABEL.to_string(), name.to_string());
    if !template.name.is_empty() {
        labels.insert(INSTANCE_TEMPLATE_LABEL.to_string(), template.name.clone());
    }
    if config.rsm_compatibility_mode {
        labels.insert(RSM_NAME_LABEL.to_string(), its.name_any());
    }

    let mut annotations = template_meta.annotations.unwrap_or_default();
    annotations.insert(POD_SPEC_HASH_ANNOTATION.to_string(), template.spec_hash.clone());

    let mut spec = template.pod_template.spec.clone().unwrap_or_default();
    spec.hostname = Some(name.to_string());
    spec.subdomain = Some(headless_service_name(its));

    let mut volumes: Vec<Volume> = template
        .volume_claim_templates
        .iter()
        .map(|claim| {
            let claim_name = claim.name_any();
            Volume {
                name: claim_name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name(&claim_name, name),
                    read_only: None,
                }),
                ..Default::default()
            }
        })
        .collect();
    if let Some(existing) = spec.volumes.take() {
        for volume in existing {
            if !volumes.iter().any(|v| v.name == volume.name) {
                volumes.push(volume);
            }
        }
    }
    spec.volumes = (!volumes.is_empty()).then_some(volumes);

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: its.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_reference(its)]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// Build the volume claims of instance `name`
///
/// Claims carry no owner reference: they outlive their pod so a recreated
/// instance finds its data.
pub fn build_pvcs(its: &InstanceSet, name: &str, template: &MergedTemplate) -> Vec<PersistentVolumeClaim> {
    let template_labels = template
        .pod_template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    template
        .volume_claim_templates
        .iter()
        .map(|claim| {
            let claim_name = claim.name_any();
            let mut labels = template_labels.clone();
            labels.extend(match_labels(its));
            labels.insert(VOLUME_CLAIM_TEMPLATE_LABEL.to_string(), claim_name.clone());
            labels.insert(POD_NAME_LABEL.to_string(), name.to_string());
            if !template.name.is_empty() {
                labels.insert(INSTANCE_TEMPLATE_LABEL.to_string(), template.name.clone());
            }
            PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(pvc_name(&claim_name, name)),
                    namespace: its.namespace(),
                    labels: Some(labels),
                    annotations: claim.metadata.annotations.clone(),
                    ..Default::default()
                },
                spec: claim.spec.clone(),
                status: None,
            }
        })
        .collect()
}

// =============================================================================
// Merging for updates
// =============================================================================

fn merged_map(
    old: &Option<BTreeMap<String, String>>,
    new: &Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut merged = old.clone().unwrap_or_default();
    if let Some(new) = new {
        merged.extend(new.clone());
    }
    (!merged.is_empty()).then_some(merged)
}

fn merge_identity(old: &mut ObjectMeta, new: &ObjectMeta) {
    append_unique(new.finalizers.as_ref(), &mut old.finalizers);
    if let Some(refs) = &new.owner_references {
        let existing = old.owner_references.get_or_insert_with(Vec::new);
        for r in refs {
            if !existing.iter().any(|e| e.uid == r.uid) {
                existing.push(r.clone());
            }
        }
    }
}

/// Merge a desired service into the live one
///
/// Labels and annotations are merged; selector, type, ports and
/// `publishNotReadyAddresses` are replaced. Allocated fields such as the
/// cluster IP are kept.
pub fn copy_and_merge_service(old: &Service, new: &Service) -> Service {
    let mut merged = old.clone();
    merge_identity(&mut merged.metadata, &new.metadata);
    merged.metadata.annotations = merged_map(&old.metadata.annotations, &new.metadata.annotations);
    merged.metadata.labels = merged_map(&old.metadata.labels, &new.metadata.labels);
    let new_spec = new.spec.clone().unwrap_or_default();
    let spec = merged.spec.get_or_insert_with(Default::default);
    spec.selector = new_spec.selector;
    spec.type_ = new_spec.type_;
    spec.publish_not_ready_addresses = new_spec.publish_not_ready_addresses;
    spec.ports = new_spec.ports;
    merged
}

/// Merge a desired config map into the live one: its data is replaced
pub fn copy_and_merge_config_map(old: &ConfigMap, new: &ConfigMap) -> ConfigMap {
    let mut merged = old.clone();
    merge_identity(&mut merged.metadata, &new.metadata);
    merged.data = new.data.clone();
    merged.binary_data = new.binary_data.clone();
    merged
}

fn storage_request(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
}

/// Merge a desired claim into the live one
///
/// Only access modes and a larger storage request are applied, since
/// volumes can be expanded but never shrunk. Returns `None` when nothing
/// would change.
pub fn copy_and_merge_pvc(
    old: &PersistentVolumeClaim,
    new: &PersistentVolumeClaim,
) -> Result<Option<PersistentVolumeClaim>> {
    let old_modes = old.spec.as_ref().and_then(|s| s.access_modes.clone());
    let new_modes = new.spec.as_ref().and_then(|s| s.access_modes.clone());
    let grown = match (storage_request(old), storage_request(new)) {
        (Some(old_size), Some(new_size)) => storage_grew(old_size, new_size)?,
        (None, Some(_)) => true,
        _ => false,
    };
    let labels = merged_map(&old.metadata.labels, &new.metadata.labels);
    let annotations = merged_map(&old.metadata.annotations, &new.metadata.annotations);
    if old_modes == new_modes
        && !grown
        && labels == old.metadata.labels
        && annotations == old.metadata.annotations
    {
        return Ok(None);
    }

    let mut merged = old.clone();
    merged.metadata.labels = labels;
    merged.metadata.annotations = annotations;
    let spec = merged.spec.get_or_insert_with(Default::default);
    spec.access_modes = new_modes;
    if grown {
        if let Some(size) = storage_request(new) {
            spec.resources
                .get_or_insert_with(Default::default)
                .requests
                .get_or_insert_with(BTreeMap::new)
                .insert("storage".to_string(), size.clone());
        }
    }
    Ok(Some(merged))
}

// =============================================================================
// Validation
// =============================================================================

fn check_spec(its: &InstanceSet) -> std::result::Result<(), String> {
    let mut template_names = BTreeSet::new();
    for template in &its.spec.instances {
        if !template_names.insert(template.name.as_str()) {
            return Err(format!("duplicate instance template name: {}", template.name));
        }
    }
    let in_templates: i32 = its.spec.instances.iter().map(InstanceTemplate::replica_count).sum();
    if in_templates > its.spec.replicas {
        return Err(format!(
            "total replicas in instances({}) should not greater than replicas in spec({})",
            in_templates, its.spec.replicas
        ));
    }
    generate_all_instance_names(its).map_err(|e| match e {
        Error::Validation { message, .. } => message,
        other => other.to_string(),
    })?;
    Ok(())
}

/// Check template names, replica totals and generated names
///
/// A violation raises an `InvalidSpec` warning on the tree, when one is
/// given, and is returned as a validation error.
pub fn validate_spec(its: &InstanceSet, tree: Option<&mut ObjectTree>) -> Result<()> {
    match check_spec(its) {
        Ok(()) => Ok(()),
        Err(message) => {
            if let Some(tree) = tree {
                tree.event(true, reasons::INVALID_SPEC, actions::RECONCILE, message.clone());
            }
            Err(Error::validation_for(its.name_any(), message))
        }
    }
}
