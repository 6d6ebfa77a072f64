//! Rolling update of outdated instances

use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, info};

use kubeblocks_common::crd::{remove_condition, ConditionStatus, InstanceSet, PodUpdatePolicy};
use kubeblocks_common::events::{actions, reasons};
use kubeblocks_common::{Error, OperatorConfig, Result};

use super::{live_root, set_its_condition, CONDITION_INSTANCE_UPDATE_RESTRICTED};
use crate::in_place::{decide_pod_update_policy, merge_in_place_fields, PodUpdatePolicy as Policy};
use crate::instance::{
    build_pod, build_pvcs, copy_and_merge_pvc, priority_of, role_priorities, InstanceSetExt,
};
use crate::pod::{is_available, is_healthy, is_pending, is_terminating, role};
use crate::reconciler::{CheckResult, ReconcileResult, Reconciler};
use crate::tree::{ObjectKind, ObjectTree};
use crate::update_plan::{build_update_plan, effective_strategy};

const ON_DELETE: &str = "OnDelete";

/// Brings outdated pods to their desired revision, in place when possible
pub struct UpdateReconciler;

/// Rolling update bounds: (partition, maxUnavailable)
///
/// A percentage maxUnavailable is taken of the replica count and rounded
/// down; either form is raised to at least one. A string that is not a
/// whole percentage is a validation error.
fn rolling_update_bounds(its: &InstanceSet) -> Result<(i32, i32)> {
    let rolling = its
        .spec
        .update_strategy
        .as_ref()
        .and_then(|s| s.rolling_update.as_ref());
    let partition = rolling.and_then(|r| r.partition).unwrap_or(0).max(0);
    let max_unavailable = match rolling.and_then(|r| r.max_unavailable.as_ref()) {
        Some(IntOrString::Int(n)) => *n,
        Some(IntOrString::String(s)) => scaled_percent(s, its.spec.replicas).ok_or_else(|| {
            Error::validation_for_field(
                its.name_any(),
                "spec.updateStrategy.rollingUpdate.maxUnavailable",
                format!("invalid value {:?}: must be an integer or a percentage", s),
            )
        })?,
        None => 1,
    };
    Ok((partition, max_unavailable.max(1)))
}

/// `raw` percent of `total`, rounded down and saturated to `i32`
fn scaled_percent(raw: &str, total: i32) -> Option<i32> {
    let percent: i64 = raw.strip_suffix('%')?.parse().ok()?;
    let scaled = i128::from(total) * i128::from(percent) / 100;
    Some(i32::try_from(scaled).unwrap_or(if scaled < 0 { i32::MIN } else { i32::MAX }))
}

fn is_on_delete(its: &InstanceSet) -> bool {
    its.spec
        .update_strategy
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        == Some(ON_DELETE)
}

/// Grow claims whose templates asked for more storage
fn expand_claims(tree: &mut ObjectTree, its: &InstanceSet, ext: &InstanceSetExt) -> Result<()> {
    let names: Vec<String> = ext.names().cloned().collect();
    for name in names {
        let Some(template) = ext.template_of(&name) else {
            continue;
        };
        for desired in build_pvcs(its, &name, template) {
            let Some(live) = tree.pvc(&desired.name_any()) else {
                continue;
            };
            if let Some(merged) = copy_and_merge_pvc(live, &desired)? {
                tree.update(merged)?;
            }
        }
    }
    Ok(())
}

impl Reconciler for UpdateReconciler {
    fn name(&self) -> &'static str {
        "update"
    }

    fn pre_condition(&self, tree: &mut ObjectTree, _config: &OperatorConfig) -> CheckResult {
        if live_root(tree).is_some_and(|its| !its.spec.paused) {
            CheckResult::Satisfied
        } else {
            CheckResult::Unsatisfied
        }
    }

    fn reconcile(&self, tree: &mut ObjectTree, config: &OperatorConfig) -> Result<ReconcileResult> {
        let Some(its) = tree.root().cloned() else {
            return Ok(ReconcileResult::Continue);
        };
        let ext = InstanceSetExt::build(&its, config)?;

        let live: BTreeSet<String> = tree.pods().iter().map(|p| p.name_any()).collect();
        if !live.iter().eq(ext.names()) {
            debug!(instance_set = %its.name_any(), "instances not aligned yet, skipping update");
            return Ok(ReconcileResult::Continue);
        }

        expand_claims(tree, &its, &ext)?;

        if is_on_delete(&its) {
            return Ok(ReconcileResult::Continue);
        }
        let (partition, max_unavailable) = match rolling_update_bounds(&its) {
            Ok(bounds) => bounds,
            Err(err) => {
                tree.event(true, reasons::INVALID_SPEC, actions::UPDATE, err.to_string());
                return Err(err);
            }
        };

        let outdated_pending: Vec<String> = tree
            .pods()
            .into_iter()
            .filter(|p| is_pending(p) && !is_terminating(p))
            .filter(|p| {
                ext.template_of(&p.name_any())
                    .is_some_and(|t| crate::pod::revision(p) != t.revision)
            })
            .map(|p| p.name_any())
            .collect();
        if !outdated_pending.is_empty() {
            for name in &outdated_pending {
                info!(pod = %name, "deleting outdated pending instance");
                tree.delete(ObjectKind::Pod, name);
            }
            return Ok(ReconcileResult::Continue);
        }

        let now = tree.now();
        let min_ready = its.spec.min_ready_seconds;
        let unavailable = tree.pods().iter().filter(|p| !is_healthy(p)).count() as i32;
        let mut budget = (max_unavailable - unavailable).max(0);
        let limit = its.spec.replicas - partition;
        let mut updated = tree
            .pods()
            .into_iter()
            .filter(|p| {
                ext.template_of(&p.name_any())
                    .is_some_and(|t| crate::pod::revision(p) == t.revision)
            })
            .count() as i32;

        let priorities = role_priorities(&its.spec.roles);
        let candidates: Vec<(String, i32)> = tree
            .pods()
            .into_iter()
            .map(|p| (p.name_any(), priority_of(&priorities, &role(p))))
            .collect();
        let steps = build_update_plan(
            candidates,
            |(name, _)| name.clone(),
            |(_, priority)| *priority,
            effective_strategy(&its.spec),
        );

        let mut retry = None;
        let mut restricted = false;
        'steps: for step in steps {
            let mut step_done = true;
            for (name, _) in step {
                let (Some(pod), Some(template)) = (tree.pod(&name).cloned(), ext.template_of(&name))
                else {
                    continue;
                };
                let policy = decide_pod_update_policy(&pod, template);
                if policy == Policy::NoOps {
                    if !is_healthy(&pod) || !is_available(&pod, min_ready, now) {
                        step_done = false;
                    }
                    continue;
                }

                step_done = false;
                if !is_healthy(&pod) {
                    debug!(pod = %name, "outdated instance is unhealthy, holding the update");
                    break 'steps;
                }
                if !is_available(&pod, min_ready, now) {
                    retry = Some(Duration::from_secs(min_ready.max(1) as u64));
                    break 'steps;
                }
                if budget <= 0 || updated >= limit {
                    break 'steps;
                }

                match policy {
                    Policy::InPlace => {
                        let desired = build_pod(&its, &name, template, config);
                        tree.update(merge_in_place_fields(&desired, &pod, config))?;
                        info!(pod = %name, revision = %template.revision, "updating instance in place");
                    }
                    _ if its.spec.pod_update_policy == PodUpdatePolicy::StrictInPlace => {
                        restricted = true;
                        tree.event(
                            true,
                            reasons::STRICT_IN_PLACE,
                            actions::UPDATE,
                            format!("instance {} can not be updated in place", name),
                        );
                        break 'steps;
                    }
                    _ => {
                        tree.delete(ObjectKind::Pod, &name);
                        info!(pod = %name, revision = %template.revision, "recreating instance");
                    }
                }
                budget -= 1;
                updated += 1;
            }
            if !step_done {
                break;
            }
        }

        if let Some(root) = tree.root_mut() {
            if restricted {
                set_its_condition(
                    root,
                    CONDITION_INSTANCE_UPDATE_RESTRICTED,
                    ConditionStatus::True,
                    reasons::STRICT_IN_PLACE,
                    "some instances need to be recreated under the StrictInPlace policy",
                );
            } else if let Some(status) = root.status.as_mut() {
                remove_condition(&mut status.conditions, CONDITION_INSTANCE_UPDATE_RESTRICTED);
            }
        }

        Ok(retry.map_or(ReconcileResult::Continue, ReconcileResult::RetryAfter))
    }
}
