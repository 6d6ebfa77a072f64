//! Role-aware update ordering
//!
//! Pods are grouped into steps. Every pod of a step may be updated together;
//! a step starts only once all earlier steps are updated and healthy.

use kubeblocks_common::crd::{InstanceSetSpec, MemberUpdateStrategy, PodManagementPolicy};

use crate::instance::{sort_by_role_and_name, LEADER_PRIORITY, LEARNER_PRIORITY};

/// Strategy in effect: the spec's, else Parallel for parallel pod
/// management and Serial otherwise
pub fn effective_strategy(spec: &InstanceSetSpec) -> MemberUpdateStrategy {
    spec.member_update_strategy.unwrap_or(match spec.pod_management_policy {
        PodManagementPolicy::Parallel => MemberUpdateStrategy::Parallel,
        PodManagementPolicy::OrderedReady => MemberUpdateStrategy::Serial,
    })
}

/// Split `items` into update steps
///
/// Items are ordered the way pods are scaled in: non-voters and unlabeled
/// pods first, the leader last. `BestEffortParallel` updates the non-voters,
/// then the lower half of the followers, then the rest of them, then the
/// leader.
pub fn build_update_plan<T>(
    mut items: Vec<T>,
    name_of: impl Fn(&T) -> String,
    priority_of: impl Fn(&T) -> i32,
    strategy: MemberUpdateStrategy,
) -> Vec<Vec<T>> {
    sort_by_role_and_name(&mut items, &name_of, &priority_of, false);
    let steps: Vec<Vec<T>> = match strategy {
        MemberUpdateStrategy::Serial => items.into_iter().map(|i| vec![i]).collect(),
        MemberUpdateStrategy::Parallel => vec![items],
        MemberUpdateStrategy::BestEffortParallel => {
            let non_voters = items
                .iter()
                .take_while(|i| priority_of(*i) <= LEARNER_PRIORITY)
                .count();
            let mut rest = items.split_off(non_voters);
            let followers = rest
                .iter()
                .take_while(|i| priority_of(*i) < LEADER_PRIORITY)
                .count();
            let leaders = rest.split_off(followers);
            let second_half = rest.split_off(followers / 2);
            vec![items, rest, second_half, leaders]
        }
    };
    steps.into_iter().filter(|s| !s.is_empty()).collect()
}
