//! The seven InstanceSet reconcilers

pub mod alignment;
pub mod assistant_object;
pub mod deletion;
pub mod fix_meta;
pub mod revision_update;
pub mod status;
pub mod update;

use kubeblocks_common::crd::{set_condition, Condition, ConditionStatus, InstanceSet, InstanceSetStatus};

use crate::tree::ObjectTree;

pub use alignment::AlignmentReconciler;
pub use assistant_object::AssistantObjectReconciler;
pub use deletion::DeletionReconciler;
pub use fix_meta::FixMetaReconciler;
pub use revision_update::RevisionUpdateReconciler;
pub use status::StatusReconciler;
pub use update::UpdateReconciler;

/// Every desired pod exists and is ready
pub const CONDITION_INSTANCE_READY: &str = "InstanceReady";
/// Every desired pod has been ready for minReadySeconds
pub const CONDITION_INSTANCE_AVAILABLE: &str = "InstanceAvailable";
/// Some pod failed
pub const CONDITION_INSTANCE_FAILURE: &str = "InstanceFailure";
/// An update is blocked by the strict in-place policy
pub const CONDITION_INSTANCE_UPDATE_RESTRICTED: &str = "InstanceUpdateRestricted";

/// The root, if present and not being deleted
pub(crate) fn live_root(tree: &ObjectTree) -> Option<&InstanceSet> {
    tree.root().filter(|its| !its.is_deleting())
}

/// Mutable status, created on first use
pub(crate) fn status_mut(its: &mut InstanceSet) -> &mut InstanceSetStatus {
    its.status.get_or_insert_with(InstanceSetStatus::default)
}

/// Set a condition for the set's current generation
pub(crate) fn set_its_condition(
    its: &mut InstanceSet,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) -> bool {
    let condition =
        Condition::new(type_, status, reason, message).with_generation(its.metadata.generation);
    set_condition(&mut status_mut(its).conditions, condition)
}
