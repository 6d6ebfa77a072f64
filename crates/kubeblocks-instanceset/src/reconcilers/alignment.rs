//! Instance alignment: create missing pods, delete obsolete ones

use kube::ResourceExt;
use tracing::{debug, info};

use kubeblocks_common::crd::PodManagementPolicy;
use kubeblocks_common::events::{actions, reasons};
use kubeblocks_common::{OperatorConfig, Result};

use super::live_root;
use crate::instance::{
    build_pod, build_pvcs, role_priorities, sort_by_role_and_name, sort_pods, validate_spec,
    InstanceSetExt,
};
use crate::pod::{is_available, is_healthy, is_terminating};
use crate::reconciler::{CheckResult, ReconcileResult, Reconciler};
use crate::tree::{ObjectKind, ObjectTree};

/// Diffs the desired instance names against the live pods
///
/// Under `OrderedReady` one pod is created per pass, and only once every
/// lower-ordinal pod is available; one obsolete pod is deleted per pass.
/// Under `Parallel` everything happens at once.
pub struct AlignmentReconciler;

impl Reconciler for AlignmentReconciler {
    fn name(&self) -> &'static str {
        "alignment"
    }

    fn pre_condition(&self, tree: &mut ObjectTree, _config: &OperatorConfig) -> CheckResult {
        let Some(its) = live_root(tree).filter(|its| !its.spec.paused).cloned() else {
            return CheckResult::Unsatisfied;
        };
        match validate_spec(&its, Some(tree)) {
            Ok(()) => CheckResult::Satisfied,
            Err(err) => CheckResult::Error(err),
        }
    }

    fn reconcile(&self, tree: &mut ObjectTree, config: &OperatorConfig) -> Result<ReconcileResult> {
        let Some(its) = tree.root().cloned() else {
            return Ok(ReconcileResult::Continue);
        };
        let ext = InstanceSetExt::build(&its, config)?;
        let ordered = its.spec.pod_management_policy == PodManagementPolicy::OrderedReady;
        let now = tree.now();

        // ascending ordinal within each template
        let mut desired: Vec<String> = ext.names().cloned().collect();
        sort_by_role_and_name(&mut desired, String::clone, |_| 0, true);

        let mut creatable = true;
        for name in &desired {
            if let Some(pod) = tree.pod(name) {
                if ordered && !is_available(pod, its.spec.min_ready_seconds, now) {
                    creatable = false;
                }
                continue;
            }
            if !creatable {
                break;
            }
            let Some(template) = ext.template_of(name) else {
                continue;
            };
            tree.add(build_pod(&its, name, template, config))?;
            info!(instance_set = %its.name_any(), pod = %name, "creating instance");
            if ordered {
                creatable = false;
            }
        }

        // claims of every desired pod that exists now, including ones that
        // were deleted by hand
        for name in &desired {
            if tree.pod(name).is_none() {
                continue;
            }
            let Some(template) = ext.template_of(name) else {
                continue;
            };
            for pvc in build_pvcs(&its, name, template) {
                if tree.pvc(&pvc.name_any()).is_none() {
                    tree.add(pvc)?;
                }
            }
        }

        let priorities = role_priorities(&its.spec.roles);
        let obsolete: Vec<(String, bool, bool)> = {
            let mut pods: Vec<_> = tree
                .pods()
                .into_iter()
                .filter(|p| !ext.contains(&p.name_any()))
                .collect();
            sort_pods(&mut pods, &priorities, false);
            pods.into_iter()
                .map(|p| (p.name_any(), is_healthy(p), is_terminating(p)))
                .collect()
        };

        for (name, healthy, terminating) in obsolete {
            if ordered && terminating {
                debug!(pod = %name, "waiting for obsolete instance to terminate");
                break;
            }
            if !terminating {
                if !healthy {
                    tree.event(
                        true,
                        reasons::UNHEALTHY_SCALE_IN,
                        actions::SCALE,
                        format!("deleting unhealthy instance {}", name),
                    );
                }
                info!(instance_set = %its.name_any(), pod = %name, "deleting obsolete instance");
                tree.delete(ObjectKind::Pod, &name);
            }
            if ordered {
                break;
            }
        }
        Ok(ReconcileResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{its_with_templates, pod, pod_names, ready_pod, sample_its, tree_with_pods, with_role};
    use crate::tree::Mutation;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn align(tree: &mut ObjectTree) {
        let config = OperatorConfig::default();
        assert!(matches!(
            AlignmentReconciler.pre_condition(tree, &config),
            CheckResult::Satisfied
        ));
        AlignmentReconciler.reconcile(tree, &config).unwrap();
    }

    fn plan(tree: &ObjectTree) -> Vec<String> {
        tree.plan().iter().map(Mutation::describe).collect()
    }

    // =========================================================================
    // Parallel
    // =========================================================================

    mod parallel {
        use super::*;

        #[test]
        fn test_creates_and_deletes_in_one_pass() {
            let mut its = its_with_templates(3, &[("a", 1), ("b", 1)]);
            its.spec.pod_management_policy = PodManagementPolicy::Parallel;
            let mut tree = tree_with_pods(its, vec![ready_pod("its-0", "r1"), pod("its-c-0", "r1")]);
            align(&mut tree);

            assert_eq!(pod_names(&tree), vec!["its-0", "its-a-0", "its-b-0"]);
            assert_eq!(
                plan(&tree),
                vec!["create Pod its-a-0", "create Pod its-b-0", "delete Pod its-c-0"]
            );
            assert_eq!(tree.events().len(), 1);
            assert_eq!(tree.events()[0].reason, reasons::UNHEALTHY_SCALE_IN);
        }

        #[test]
        fn test_scale_in_removes_highest_ordinals() {
            let mut its = sample_its(1);
            its.spec.pod_management_policy = PodManagementPolicy::Parallel;
            let pods = vec![ready_pod("its-0", "r1"), ready_pod("its-1", "r1"), ready_pod("its-2", "r1")];
            let mut tree = tree_with_pods(its, pods);
            align(&mut tree);

            assert_eq!(pod_names(&tree), vec!["its-0"]);
            assert!(tree.events().is_empty());
        }
    }

    // =========================================================================
    // OrderedReady
    // =========================================================================

    mod ordered {
        use super::*;

        #[test]
        fn test_creates_first_pod_only() {
            let mut tree = tree_with_pods(sample_its(3), vec![]);
            align(&mut tree);
            assert_eq!(pod_names(&tree), vec!["its-0"]);
        }

        #[test]
        fn test_waits_for_unavailable_predecessor() {
            let mut tree = tree_with_pods(sample_its(3), vec![pod("its-0", "r1")]);
            align(&mut tree);
            assert!(plan(&tree).is_empty());
        }

        #[test]
        fn test_creates_next_once_predecessor_available() {
            let mut tree = tree_with_pods(sample_its(3), vec![ready_pod("its-0", "r1")]);
            align(&mut tree);
            assert_eq!(pod_names(&tree), vec!["its-0", "its-1"]);
        }

        #[test]
        fn test_deletes_one_obsolete_pod_leader_last() {
            let mut its = sample_its(1);
            its.spec.roles = crate::testing::roles();
            let pods = vec![
                with_role(ready_pod("its-0", "r1"), "follower"),
                with_role(ready_pod("its-1", "r1"), "leader"),
                with_role(ready_pod("its-2", "r1"), "follower"),
            ];
            let mut tree = tree_with_pods(its, pods);
            align(&mut tree);
            assert_eq!(plan(&tree), vec!["delete Pod its-2"]);

            let pods = vec![
                with_role(ready_pod("its-0", "r1"), "follower"),
                with_role(ready_pod("its-1", "r1"), "leader"),
            ];
            let mut its = sample_its(1);
            its.spec.roles = crate::testing::roles();
            let mut tree = tree_with_pods(its, pods);
            align(&mut tree);
            assert_eq!(plan(&tree), vec!["delete Pod its-1"]);
        }

        #[test]
        fn test_paused_set_is_skipped() {
            let mut its = sample_its(3);
            its.spec.paused = true;
            let mut tree = tree_with_pods(its, vec![]);
            assert!(matches!(
                AlignmentReconciler.pre_condition(&mut tree, &OperatorConfig::default()),
                CheckResult::Unsatisfied
            ));
        }
    }

    #[test]
    fn test_creates_claims_with_pods() {
        let mut its = sample_its(1);
        its.spec.volume_claim_templates = vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec::default()),
            status: None,
        }];
        let mut tree = tree_with_pods(its, vec![]);
        align(&mut tree);
        assert_eq!(
            plan(&tree),
            vec!["create PersistentVolumeClaim data-its-0", "create Pod its-0"]
        );
    }
}
