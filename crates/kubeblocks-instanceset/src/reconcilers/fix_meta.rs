//! InstanceSet finalizer

use kube::ResourceExt;

use kubeblocks_common::constants::INSTANCE_SET_FINALIZER;
use kubeblocks_common::{OperatorConfig, Result};

use super::live_root;
use crate::reconciler::{CheckResult, ReconcileResult, Reconciler};
use crate::tree::ObjectTree;

/// Adds the finalizer to live InstanceSets and commits right away
pub struct FixMetaReconciler;

impl Reconciler for FixMetaReconciler {
    fn name(&self) -> &'static str {
        "fix-meta"
    }

    fn pre_condition(&self, tree: &mut ObjectTree, _config: &OperatorConfig) -> CheckResult {
        match live_root(tree) {
            Some(its) if !its.finalizers().iter().any(|f| f == INSTANCE_SET_FINALIZER) => {
                CheckResult::Satisfied
            }
            _ => CheckResult::Unsatisfied,
        }
    }

    fn reconcile(&self, tree: &mut ObjectTree, _config: &OperatorConfig) -> Result<ReconcileResult> {
        if let Some(its) = tree.root_mut() {
            its.finalizers_mut().push(INSTANCE_SET_FINALIZER.to_string());
        }
        Ok(ReconcileResult::Commit)
    }
}
