//! The reconciler trait and the chain driver
//!
//! A reconciler first checks its precondition against the tree. An
//! unsatisfied precondition skips it silently; a precondition error ends the
//! pass. Satisfied reconcilers edit the tree and tell the driver whether to
//! go on, stop, or come back later.

use std::time::Duration;

use tracing::debug;

use kubeblocks_common::{Error, OperatorConfig, Result};

use crate::reconcilers::{
    AlignmentReconciler, AssistantObjectReconciler, DeletionReconciler, FixMetaReconciler,
    RevisionUpdateReconciler, StatusReconciler, UpdateReconciler,
};
use crate::tree::ObjectTree;

/// Outcome of a precondition check
#[derive(Debug)]
pub enum CheckResult {
    /// Run the reconciler
    Satisfied,
    /// Skip the reconciler
    Unsatisfied,
    /// End the pass with this error
    Error(Error),
}

/// What the driver does after a reconciler ran
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Run the next reconciler
    Continue,
    /// Stop here and apply the tree
    Commit,
    /// Run the next reconciler, and run the pass again after the delay
    RetryAfter(Duration),
}

/// One step of an InstanceSet reconcile pass
pub trait Reconciler: Send + Sync {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// Decide whether this reconciler applies to the tree
    fn pre_condition(&self, tree: &mut ObjectTree, config: &OperatorConfig) -> CheckResult;

    /// Edit the tree
    fn reconcile(&self, tree: &mut ObjectTree, config: &OperatorConfig) -> Result<ReconcileResult>;
}

/// The chain run for every InstanceSet, in order
pub fn instance_set_reconcilers() -> Vec<Box<dyn Reconciler>> {
    vec![
        Box::new(FixMetaReconciler),
        Box::new(RevisionUpdateReconciler),
        Box::new(AssistantObjectReconciler),
        Box::new(AlignmentReconciler),
        Box::new(UpdateReconciler),
        Box::new(StatusReconciler),
        Box::new(DeletionReconciler),
    ]
}

/// Run the chain over `tree`
///
/// Returns the shortest retry delay any reconciler asked for, or `None` if
/// the pass converged.
pub fn run_reconcilers(
    reconcilers: &[Box<dyn Reconciler>],
    tree: &mut ObjectTree,
    config: &OperatorConfig,
) -> Result<Option<Duration>> {
    let mut retry: Option<Duration> = None;
    for reconciler in reconcilers {
        match reconciler.pre_condition(tree, config) {
            CheckResult::Satisfied => {}
            CheckResult::Unsatisfied => {
                debug!(reconciler = reconciler.name(), "precondition not met, skipping");
                continue;
            }
            CheckResult::Error(err) => return Err(err),
        }
        match reconciler.reconcile(tree, config)? {
            ReconcileResult::Continue => {}
            ReconcileResult::Commit => {
                debug!(reconciler = reconciler.name(), "committing early");
                break;
            }
            ReconcileResult::RetryAfter(after) => {
                debug!(reconciler = reconciler.name(), ?after, "retry requested");
                retry = Some(retry.map_or(after, |r| r.min(after)));
            }
        }
    }
    Ok(retry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_its;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        name: &'static str,
        check: fn() -> CheckResult,
        result: fn() -> Result<ReconcileResult>,
        calls: Arc<AtomicUsize>,
    }

    impl Reconciler for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn pre_condition(&self, _tree: &mut ObjectTree, _config: &OperatorConfig) -> CheckResult {
            (self.check)()
        }

        fn reconcile(&self, _tree: &mut ObjectTree, _config: &OperatorConfig) -> Result<ReconcileResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn step(
        name: &'static str,
        check: fn() -> CheckResult,
        result: fn() -> Result<ReconcileResult>,
    ) -> (Box<dyn Reconciler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Scripted {
                name,
                check,
                result,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    fn run(chain: &[Box<dyn Reconciler>]) -> Result<Option<Duration>> {
        let mut tree = ObjectTree::new(sample_its(1), Utc::now());
        run_reconcilers(chain, &mut tree, &OperatorConfig::default())
    }

    #[test]
    fn test_unsatisfied_reconcilers_are_skipped() {
        let (a, a_calls) = step("a", || CheckResult::Unsatisfied, || Ok(ReconcileResult::Continue));
        let (b, b_calls) = step("b", || CheckResult::Satisfied, || Ok(ReconcileResult::Continue));

        assert_eq!(run(&[a, b]).unwrap(), None);
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_commit_stops_the_chain() {
        let (a, _) = step("a", || CheckResult::Satisfied, || Ok(ReconcileResult::Commit));
        let (b, b_calls) = step("b", || CheckResult::Satisfied, || Ok(ReconcileResult::Continue));

        assert_eq!(run(&[a, b]).unwrap(), None);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shortest_retry_wins_and_chain_continues() {
        let (a, _) = step("a", || CheckResult::Satisfied, || {
            Ok(ReconcileResult::RetryAfter(Duration::from_secs(10)))
        });
        let (b, _) = step("b", || CheckResult::Satisfied, || {
            Ok(ReconcileResult::RetryAfter(Duration::from_secs(1)))
        });
        let (c, c_calls) = step("c", || CheckResult::Satisfied, || Ok(ReconcileResult::Continue));

        assert_eq!(run(&[a, b, c]).unwrap(), Some(Duration::from_secs(1)));
        assert_eq!(c_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_precondition_error_ends_the_pass() {
        let (a, _) = step(
            "a",
            || CheckResult::Error(Error::validation("bad spec")),
            || Ok(ReconcileResult::Continue),
        );
        let (b, b_calls) = step("b", || CheckResult::Satisfied, || Ok(ReconcileResult::Continue));

        assert!(matches!(run(&[a, b]), Err(Error::Validation { .. })));
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reconcile_error_ends_the_pass() {
        let (a, _) = step("a", || CheckResult::Satisfied, || Err(Error::internal("boom")));
        let (b, b_calls) = step("b", || CheckResult::Satisfied, || Ok(ReconcileResult::Continue));

        assert!(run(&[a, b]).is_err());
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_chain_order() {
        let names: Vec<_> = instance_set_reconcilers().iter().map(|r| r.name()).collect();
        assert_eq!(
            names,
            vec![
                "fix-meta",
                "revision-update",
                "assistant-object",
                "alignment",
                "update",
                "status",
                "deletion",
            ]
        );
    }
}
