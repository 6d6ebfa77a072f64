//! InstanceSet reconciliation for KubeBlocks
//!
//! An InstanceSet owns a group of pods with stable names. One reconcile loads
//! the set and its secondary objects into an [`tree::ObjectTree`], runs the
//! fixed reconciler chain over it and applies the difference between the
//! edited tree and the snapshot it was loaded from.
//!
//! The reconcilers are plain functions of the tree: they never touch the API
//! server and can be tested without a runtime.

pub mod controller;
pub mod executor;
pub mod in_place;
pub mod instance;
pub mod pod;
pub mod reconciler;
pub mod reconcilers;
pub mod revision;
pub mod store;
pub mod tree;
pub mod update_plan;

pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use reconciler::{instance_set_reconcilers, run_reconcilers, CheckResult, ReconcileResult, Reconciler};
pub use store::{InstanceSetStore, KubeInstanceSetStore};
pub use tree::{Mutation, ObjectKind, ObjectTree, TreeObject};

/// Controller name used for events and logs
pub const CONTROLLER_NAME: &str = "instanceset-controller";

#[cfg(test)]
pub(crate) mod testing;
