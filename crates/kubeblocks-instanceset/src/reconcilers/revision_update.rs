//! Desired revisions of every instance

use tracing::debug;

use kubeblocks_common::{OperatorConfig, Result};

use super::{live_root, status_mut};
use crate::instance::{validate_spec, InstanceSetExt};
use crate::reconciler::{CheckResult, ReconcileResult, Reconciler};
use crate::revision::set_update_revisions;
use crate::tree::ObjectTree;

/// Records the instance → revision map whenever the spec changed
///
/// Marks the generation observed once the map is written.
pub struct RevisionUpdateReconciler;

impl Reconciler for RevisionUpdateReconciler {
    fn name(&self) -> &'static str {
        "revision-update"
    }

    fn pre_condition(&self, tree: &mut ObjectTree, _config: &OperatorConfig) -> CheckResult {
        let Some(its) = live_root(tree).filter(|its| its.is_updating()).cloned() else {
            return CheckResult::Unsatisfied;
        };
        match validate_spec(&its, Some(tree)) {
            Ok(()) => CheckResult::Satisfied,
            Err(err) => CheckResult::Error(err),
        }
    }

    fn reconcile(&self, tree: &mut ObjectTree, config: &OperatorConfig) -> Result<ReconcileResult> {
        let Some(its) = tree.root_mut() else {
            return Ok(ReconcileResult::Continue);
        };
        let revisions = InstanceSetExt::build(its, config)?.revisions();
        let generation = its.metadata.generation.unwrap_or_default();
        let status = status_mut(its);
        set_update_revisions(status, &revisions, config.revision_compression_threshold)?;
        status.observed_generation = generation;
        debug!(instances = revisions.len(), generation, "update revisions recorded");
        Ok(ReconcileResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::update_revisions;
    use crate::testing::{its_with_templates, sample_its};
    use chrono::Utc;
    use kubeblocks_common::events::reasons;
    use kubeblocks_common::Error;

    #[test]
    fn test_records_revisions_and_observes_generation() {
        let mut its = sample_its(3);
        its.metadata.generation = Some(2);
        let mut tree = ObjectTree::new(its, Utc::now());
        let config = OperatorConfig::default();

        assert!(matches!(
            RevisionUpdateReconciler.pre_condition(&mut tree, &config),
            CheckResult::Satisfied
        ));
        RevisionUpdateReconciler.reconcile(&mut tree, &config).unwrap();

        let status = tree.root().unwrap().status.clone().unwrap();
        assert_eq!(status.observed_generation, 2);
        let revisions = update_revisions(&status).unwrap();
        assert_eq!(
            revisions.keys().cloned().collect::<Vec<_>>(),
            vec!["its-0", "its-1", "its-2"]
        );
        assert!(!tree.root().unwrap().is_updating());
    }

    #[test]
    fn test_large_sets_store_compressed_revisions() {
        let mut its = sample_its(5);
        its.metadata.generation = Some(2);
        let mut tree = ObjectTree::new(its, Utc::now());
        let config = OperatorConfig {
            revision_compression_threshold: 2,
            ..Default::default()
        };

        RevisionUpdateReconciler.reconcile(&mut tree, &config).unwrap();
        let status = tree.root().unwrap().status.clone().unwrap();
        assert!(status.update_revisions.is_empty());
        assert!(status.compressed_update_revisions.is_some());
        assert_eq!(update_revisions(&status).unwrap().len(), 5);
    }

    #[test]
    fn test_skips_when_generation_observed() {
        let mut tree = ObjectTree::new(sample_its(1), Utc::now());
        assert!(matches!(
            RevisionUpdateReconciler.pre_condition(&mut tree, &OperatorConfig::default()),
            CheckResult::Unsatisfied
        ));
    }

    #[test]
    fn test_invalid_spec_is_an_error_with_event() {
        let mut its = its_with_templates(1, &[("big", 2)]);
        its.metadata.generation = Some(2);
        let mut tree = ObjectTree::new(its, Utc::now());

        let result = RevisionUpdateReconciler.pre_condition(&mut tree, &OperatorConfig::default());
        assert!(matches!(result, CheckResult::Error(Error::Validation { .. })));
        assert_eq!(tree.events()[0].reason, reasons::INVALID_SPEC);
    }
}
