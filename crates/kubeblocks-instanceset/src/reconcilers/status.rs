//! InstanceSet status from the pods in the tree

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use kubeblocks_common::crd::{
    remove_condition, ConditionStatus, InstanceSet, InstanceTemplateStatus, MemberStatus,
};
use kubeblocks_common::{OperatorConfig, Result};

use super::{
    live_root, set_its_condition, status_mut, CONDITION_INSTANCE_AVAILABLE,
    CONDITION_INSTANCE_FAILURE, CONDITION_INSTANCE_READY,
};
use crate::instance::{
    parse_parent_name_and_ordinal, role_priorities, sort_pods, InstanceSetExt, MergedTemplate,
};
use crate::pod::{is_available, is_created, is_failed, is_ready, is_terminating, revision, role};
use crate::reconciler::{CheckResult, ReconcileResult, Reconciler};
use crate::revision::{current_revisions, promote_update_revisions, update_revisions};
use crate::tree::ObjectTree;

const AVAILABILITY_RECHECK: Duration = Duration::from_secs(1);

/// Recomputes counts, revisions, conditions and members of the root
pub struct StatusReconciler;

#[derive(Default)]
struct Counts {
    replicas: i32,
    ready: i32,
    available: i32,
    current: i32,
    updated: i32,
}

impl Counts {
    fn add(
        &mut self,
        pod: &Pod,
        min_ready_seconds: i32,
        tree: &ObjectTree,
        current: &BTreeMap<String, String>,
        update: &BTreeMap<String, String>,
    ) {
        let name = pod.name_any();
        self.replicas += 1;
        if is_ready(pod) {
            self.ready += 1;
        }
        if is_available(pod, min_ready_seconds, tree.now()) {
            self.available += 1;
        }
        if is_terminating(pod) {
            return;
        }
        if current.get(&name).is_some_and(|r| r == revision(pod)) {
            self.current += 1;
        }
        if update.get(&name).is_some_and(|r| r == revision(pod)) {
            self.updated += 1;
        }
    }
}

/// A condition whose message lists the instances failing it
fn set_listed_condition(
    its: &mut InstanceSet,
    type_: &str,
    failing: &[String],
    ok_reason: &str,
    failed_reason: &str,
) -> Result<()> {
    if failing.is_empty() {
        set_its_condition(its, type_, ConditionStatus::True, ok_reason, "");
    } else {
        let message = serde_json::to_string(failing)?;
        set_its_condition(its, type_, ConditionStatus::False, failed_reason, message);
    }
    Ok(())
}

fn members_status(its: &InstanceSet, pods: &[&Pod]) -> Vec<MemberStatus> {
    let priorities = role_priorities(&its.spec.roles);
    let mut members: Vec<&Pod> = pods
        .iter()
        .copied()
        .filter(|p| is_ready(p) && !role(p).is_empty())
        .collect();
    sort_pods(&mut members, &priorities, true);
    members
        .into_iter()
        .filter_map(|p| {
            let role = role(p);
            let replica_role = its
                .spec
                .roles
                .iter()
                .find(|r| r.name.to_lowercase() == role)?;
            Some(MemberStatus {
                pod_name: p.name_any(),
                replica_role: Some(replica_role.clone()),
            })
        })
        .collect()
}

fn templates_status(
    templates: &[MergedTemplate],
    ext: &InstanceSetExt,
    pods: &[&Pod],
    min_ready_seconds: i32,
    tree: &ObjectTree,
    current: &BTreeMap<String, String>,
    update: &BTreeMap<String, String>,
) -> Vec<InstanceTemplateStatus> {
    let mut statuses: Vec<InstanceTemplateStatus> = templates
        .iter()
        .filter(|t| !t.name.is_empty())
        .map(|t| {
            let mut counts = Counts::default();
            for pod in pods {
                if ext.template_of(&pod.name_any()).is_some_and(|pt| pt.name == t.name) {
                    counts.add(pod, min_ready_seconds, tree, current, update);
                }
            }
            InstanceTemplateStatus {
                name: t.name.clone(),
                replicas: counts.replicas,
                ready_replicas: counts.ready,
                available_replicas: counts.available,
                current_replicas: counts.current,
                updated_replicas: counts.updated,
            }
        })
        .collect();
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    statuses
}

impl Reconciler for StatusReconciler {
    fn name(&self) -> &'static str {
        "status"
    }

    fn pre_condition(&self, tree: &mut ObjectTree, _config: &OperatorConfig) -> CheckResult {
        if live_root(tree).is_some_and(|its| !its.is_updating()) {
            CheckResult::Satisfied
        } else {
            CheckResult::Unsatisfied
        }
    }

    fn reconcile(&self, tree: &mut ObjectTree, config: &OperatorConfig) -> Result<ReconcileResult> {
        let Some(mut its) = tree.root().cloned() else {
            return Ok(ReconcileResult::Continue);
        };
        let ext = InstanceSetExt::build(&its, config)?;
        let min_ready = its.spec.min_ready_seconds;
        let status = its.status.clone().unwrap_or_default();
        let update = update_revisions(&status)?;
        let current = current_revisions(&status)?;

        let all_pods = tree.pods();
        let pods: Vec<&Pod> = all_pods.iter().copied().filter(|p| is_created(p)).collect();

        let mut counts = Counts::default();
        for pod in &pods {
            counts.add(pod, min_ready, tree, &current, &update);
        }

        let its_name = its.name_any();
        let mut ordinals: Vec<i32> = all_pods
            .iter()
            .map(|p| parse_parent_name_and_ordinal(&p.name_any()))
            .filter(|(parent, ordinal)| *parent == its_name && *ordinal >= 0)
            .map(|(_, ordinal)| ordinal)
            .collect();
        ordinals.sort_unstable();

        let not_ready: Vec<String> = ext
            .names()
            .filter(|n| tree.pod(n).map_or(true, |p| !is_ready(p)))
            .cloned()
            .collect();
        let not_available: Vec<String> = ext
            .names()
            .filter(|n| tree.pod(n).map_or(true, |p| !is_available(p, min_ready, tree.now())))
            .cloned()
            .collect();
        let failed: Vec<String> = pods
            .iter()
            .filter(|p| is_failed(p))
            .map(|p| p.name_any())
            .collect();

        let templates = templates_status(&ext.templates, &ext, &pods, min_ready, tree, &current, &update);
        let members = members_status(&its, &pods);

        let status = status_mut(&mut its);
        status.replicas = counts.replicas;
        status.ready_replicas = counts.ready;
        status.available_replicas = counts.available;
        status.current_replicas = counts.current;
        status.updated_replicas = counts.updated;
        status.ordinals = ordinals;
        status.templates_status = templates;
        status.members_status = members;
        if counts.replicas == its.spec.replicas && counts.updated == counts.replicas {
            let status = status_mut(&mut its);
            promote_update_revisions(status);
            status.current_replicas = status.updated_replicas;
        }

        set_listed_condition(&mut its, CONDITION_INSTANCE_READY, &not_ready, "Ready", "NotReady")?;
        set_listed_condition(
            &mut its,
            CONDITION_INSTANCE_AVAILABLE,
            &not_available,
            "Available",
            "NotAvailable",
        )?;
        if failed.is_empty() {
            remove_condition(&mut status_mut(&mut its).conditions, CONDITION_INSTANCE_FAILURE);
        } else {
            let message = serde_json::to_string(&failed)?;
            set_its_condition(
                &mut its,
                CONDITION_INSTANCE_FAILURE,
                ConditionStatus::True,
                "InstanceFailure",
                message,
            );
        }

        let retry = min_ready > 0 && counts.available != counts.ready;
        if let Some(root) = tree.root_mut() {
            *root = its;
        }
        Ok(if retry {
            ReconcileResult::RetryAfter(AVAILABILITY_RECHECK)
        } else {
            ReconcileResult::Continue
        })
    }
}
