//! In-place pod updates
//!
//! Some pod fields can change on a running pod: metadata, container images,
//! `activeDeadlineSeconds`, added tolerations and, where the cluster supports
//! resize, CPU and memory. A pod whose template differs from the desired one
//! only in those fields is patched; any other difference means recreating it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use kubeblocks_common::constants::POD_SPEC_HASH_ANNOTATION;
use kubeblocks_common::{OperatorConfig, Result};

use crate::instance::MergedTemplate;
use crate::revision::{hash_json, strip_cpu_and_memory};

/// How an outdated pod is brought to its template
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodUpdatePolicy {
    /// Already at the desired revision
    NoOps,
    /// Patch the running pod
    InPlace,
    /// Delete it so it is recreated
    Recreate,
}

/// A copy of `template` without the fields an in-place update can change
pub fn filter_in_place_fields(template: &PodTemplateSpec, config: &OperatorConfig) -> PodTemplateSpec {
    let mut filtered = template.clone();
    if let Some(meta) = filtered.metadata.as_mut() {
        meta.annotations = None;
        meta.labels = None;
    }
    if let Some(spec) = filtered.spec.as_mut() {
        spec.active_deadline_seconds = None;
        spec.tolerations = None;
        for container in spec
            .containers
            .iter_mut()
            .chain(spec.init_containers.iter_mut().flatten())
        {
            container.image = None;
        }
    }
    if config.vertical_scaling.is_supported() || config.ignore_pod_vertical_scaling {
        strip_cpu_and_memory(&mut filtered);
    }
    filtered
}

/// Hash of a template's fields that in-place updates cannot change
pub fn pod_spec_hash(template: &PodTemplateSpec, config: &OperatorConfig) -> Result<String> {
    hash_json(&filter_in_place_fields(template, config))
}

/// Decide how `pod` reaches `template`
///
/// The pod's spec-hash annotation was recorded when it was built. Comparing
/// it to the template's avoids diffing against fields the API server
/// defaulted on the live pod.
pub fn decide_pod_update_policy(pod: &Pod, template: &MergedTemplate) -> PodUpdatePolicy {
    if crate::pod::revision(pod) == template.revision {
        return PodUpdatePolicy::NoOps;
    }
    let live_hash = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(POD_SPEC_HASH_ANNOTATION));
    if live_hash == Some(&template.spec_hash) {
        PodUpdatePolicy::InPlace
    } else {
        PodUpdatePolicy::Recreate
    }
}

fn merge_cpu_and_memory(
    desired: Option<&BTreeMap<String, Quantity>>,
    live: &mut Option<BTreeMap<String, Quantity>>,
) {
    let Some(desired) = desired else { return };
    for key in ["cpu", "memory"] {
        match desired.get(key) {
            Some(value) => {
                live.get_or_insert_with(BTreeMap::new)
                    .insert(key.to_string(), value.clone());
            }
            None => {
                if let Some(live) = live.as_mut() {
                    live.remove(key);
                }
            }
        }
    }
}

fn merge_containers(desired: &[Container], live: &mut [Container], resources: bool) {
    for live_container in live.iter_mut() {
        let Some(want) = desired.iter().find(|c| c.name == live_container.name) else {
            continue;
        };
        live_container.image = want.image.clone();
        if resources {
            let want_resources = want.resources.clone().unwrap_or_default();
            let live_resources = live_container.resources.get_or_insert_with(Default::default);
            merge_cpu_and_memory(want_resources.requests.as_ref(), &mut live_resources.requests);
            merge_cpu_and_memory(want_resources.limits.as_ref(), &mut live_resources.limits);
        }
    }
}

/// Apply `desired`'s in-place updatable fields to the live pod
///
/// Labels and annotations are merged, tolerations appended, images and
/// (unless ignored) CPU/memory copied by container name.
pub fn merge_in_place_fields(desired: &Pod, live: &Pod, config: &OperatorConfig) -> Pod {
    let mut merged = live.clone();

    for (src, dst) in [
        (&desired.metadata.labels, &mut merged.metadata.labels),
        (&desired.metadata.annotations, &mut merged.metadata.annotations),
    ] {
        if let Some(src) = src {
            dst.get_or_insert_with(BTreeMap::new).extend(src.clone());
        }
    }

    let (Some(want), Some(spec)) = (desired.spec.as_ref(), merged.spec.as_mut()) else {
        return merged;
    };
    spec.active_deadline_seconds = want.active_deadline_seconds;
    if let Some(tolerations) = &want.tolerations {
        let live = spec.tolerations.get_or_insert_with(Vec::new);
        for toleration in tolerations {
            if !live.contains(toleration) {
                live.push(toleration.clone());
            }
        }
    }
    let resources = !config.ignore_pod_vertical_scaling;
    merge_containers(&want.containers, &mut spec.containers, resources);
    if let (Some(want_init), Some(live_init)) =
        (want.init_containers.as_ref(), spec.init_containers.as_mut())
    {
        merge_containers(want_init, live_init, resources);
    }
    merged
}
