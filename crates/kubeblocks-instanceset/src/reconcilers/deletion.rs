//! Teardown of a deleted InstanceSet

use tracing::info;

use kubeblocks_common::{OperatorConfig, Result};

use crate::reconciler::{CheckResult, ReconcileResult, Reconciler};
use crate::tree::ObjectTree;

/// Deletes every secondary object, then releases the root
pub struct DeletionReconciler;

impl Reconciler for DeletionReconciler {
    fn name(&self) -> &'static str {
        "deletion"
    }

    fn pre_condition(&self, tree: &mut ObjectTree, _config: &OperatorConfig) -> CheckResult {
        if tree.root().is_some_and(|its| its.is_deleting()) {
            CheckResult::Satisfied
        } else {
            CheckResult::Unsatisfied
        }
    }

    fn reconcile(&self, tree: &mut ObjectTree, _config: &OperatorConfig) -> Result<ReconcileResult> {
        if tree.has_secondary_objects() {
            info!("deleting secondary objects");
            tree.delete_secondary_objects();
        } else {
            info!("secondary objects gone, releasing instance set");
            tree.delete_root();
        }
        Ok(ReconcileResult::Continue)
    }
}
