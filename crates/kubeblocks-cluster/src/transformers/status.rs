//! Cluster status aggregation
//!
//! Every pass recomputes the per-component and per-sharding phases from the
//! running Components and folds them into one cluster phase with
//! [`compose_cluster_phase`]. A Component only contributes its phase once it
//! has caught up with the cluster's generation; until then it counts as
//! unknown.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info};

use kubeblocks_common::constants::component_short_name;
use kubeblocks_common::crd::{
    find_condition, ClusterComponentStatus, ClusterPhase, ClusterShardingStatus, Component,
    ComponentPhase, ConditionStatus,
};
use kubeblocks_common::events::{actions, reasons};
use kubeblocks_common::Result;

use super::{
    set_cluster_condition, status_mut, Transformer, CONDITION_APPLY_RESOURCES,
    CONDITION_AVAILABLE, CONDITION_READY,
};
use crate::builder::cluster_labels;
use crate::context::TransformContext;

const REASON_APPLY_SUCCEED: &str = "ApplyResourcesSucceed";
const REASON_AVAILABLE: &str = "Available";
const REASON_UNAVAILABLE: &str = "Unavailable";

/// Fold child phases into a cluster phase
///
/// The rules are tried in order and the first match wins. `None` means the
/// phase should not change this pass, which is also the answer for an empty
/// input.
pub fn compose_cluster_phase(phases: &[Option<ComponentPhase>]) -> Option<ClusterPhase> {
    use ComponentPhase::*;

    if phases.is_empty() {
        return None;
    }
    let all = |f: fn(Option<ComponentPhase>) -> bool| phases.iter().copied().all(f);
    let any = |p: ComponentPhase| phases.iter().any(|x| *x == Some(p));

    if all(|p| p == Some(Stopped)) {
        Some(ClusterPhase::Stopped)
    } else if all(|p| matches!(p, Some(Running | Stopped))) {
        Some(ClusterPhase::Running)
    } else if all(|p| matches!(p, None | Some(Creating))) {
        Some(ClusterPhase::Creating)
    } else if all(|p| matches!(p, Some(Creating | Running | Updating))) || any(Starting) {
        Some(ClusterPhase::Updating)
    } else if any(Stopping) {
        Some(ClusterPhase::Stopping)
    } else if all(|p| p == Some(Failed)) {
        Some(ClusterPhase::Failed)
    } else if any(Failed) {
        Some(ClusterPhase::Abnormal)
    } else {
        None
    }
}

/// Phase of a sharding seen as one virtual component
///
/// Shards are composed with the cluster rules; a partially failed sharding is
/// reported as failed.
pub fn compose_sharding_phase(phases: &[Option<ComponentPhase>]) -> Option<ComponentPhase> {
    compose_cluster_phase(phases).map(|phase| match phase {
        ClusterPhase::Creating => ComponentPhase::Creating,
        ClusterPhase::Running => ComponentPhase::Running,
        ClusterPhase::Updating => ComponentPhase::Updating,
        ClusterPhase::Stopping => ComponentPhase::Stopping,
        ClusterPhase::Stopped => ComponentPhase::Stopped,
        ClusterPhase::Deleting => ComponentPhase::Deleting,
        ClusterPhase::Failed | ClusterPhase::Abnormal => ComponentPhase::Failed,
    })
}

/// Reported phase of a Component, if it reflects `generation`
fn observed_phase(comp: &Component, generation: i64) -> Option<ComponentPhase> {
    if comp.is_up_to_date(generation) {
        comp.phase()
    } else {
        None
    }
}

fn is_available(comp: &Component) -> bool {
    comp.status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, CONDITION_AVAILABLE))
        .is_some_and(|c| c.is_true())
}

/// Writes the cluster status from the running Components
pub struct StatusTransformer;

#[async_trait]
impl Transformer for StatusTransformer {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn transform(&self, ctx: &mut TransformContext) -> Result<()> {
        if ctx.orig_cluster.is_deleting() {
            status_mut(ctx).phase = Some(ClusterPhase::Deleting);
            return Ok(());
        }

        let cluster_name = ctx.cluster_name();
        let generation = ctx.cluster.generation();
        if ctx.cluster.is_updating() {
            status_mut(ctx).observed_generation = Some(generation);
        }
        set_cluster_condition(
            ctx,
            CONDITION_APPLY_RESOURCES,
            ConditionStatus::True,
            REASON_APPLY_SUCCEED,
            format!("Successfully applied for resources of Cluster: {}", cluster_name),
        );

        let running = ctx
            .store
            .list_components(&ctx.namespace(), &cluster_labels(&cluster_name))
            .await?;
        let (shards, plain): (Vec<&Component>, Vec<&Component>) =
            running.iter().partition(|c| c.sharding_name().is_some());

        let components = component_statuses(ctx, &plain, generation);
        let shardings = sharding_statuses(ctx, &shards, generation);

        let status = status_mut(ctx);
        status.components = components;
        status.shardings = shardings;

        let phases: Vec<Option<ComponentPhase>> = status
            .components
            .values()
            .map(|c| c.phase)
            .chain(status.shardings.values().map(|s| s.phase))
            .collect();
        let failed: Vec<String> = status
            .components
            .iter()
            .filter(|(_, c)| c.phase == Some(ComponentPhase::Failed))
            .map(|(name, _)| name.clone())
            .chain(
                status
                    .shardings
                    .iter()
                    .filter(|(_, s)| s.phase == Some(ComponentPhase::Failed))
                    .map(|(name, _)| name.clone()),
            )
            .collect();

        let old_phase = ctx.orig_cluster.status.as_ref().and_then(|s| s.phase);
        let new_phase = compose_cluster_phase(&phases);
        if let Some(phase) = new_phase {
            if old_phase != Some(phase) {
                info!(cluster = %cluster_name, from = ?old_phase, to = %phase, "cluster phase changed");
            }
            status_mut(ctx).phase = Some(phase);
        } else {
            debug!(cluster = %cluster_name, "cluster phase unchanged");
        }

        if new_phase == Some(ClusterPhase::Running) && old_phase != Some(ClusterPhase::Running) {
            let message = format!("Cluster: {} is ready, current phase is Running", cluster_name);
            set_cluster_condition(
                ctx,
                CONDITION_READY,
                ConditionStatus::True,
                reasons::CLUSTER_READY,
                message.clone(),
            );
            ctx.event(EventType::Normal, reasons::CLUSTER_READY, actions::RECONCILE, message)
                .await;
        }
        if !failed.is_empty() {
            let message = format!("the following components are not ready: {:?}", failed);
            let changed = set_cluster_condition(
                ctx,
                CONDITION_READY,
                ConditionStatus::False,
                reasons::COMPONENTS_NOT_READY,
                message.clone(),
            );
            if changed {
                ctx.event(
                    EventType::Warning,
                    reasons::COMPONENTS_NOT_READY,
                    actions::RECONCILE,
                    message,
                )
                .await;
            }
        }
        if new_phase == Some(ClusterPhase::Failed) && old_phase != Some(ClusterPhase::Failed) {
            ctx.event(
                EventType::Warning,
                reasons::CLUSTER_FAILED,
                actions::RECONCILE,
                format!("Cluster: {} has failed, check the status of its components", cluster_name),
            )
            .await;
        }

        let live: Vec<&Component> = running.iter().filter(|c| !c.is_deleting()).collect();
        if !live.is_empty() {
            let unavailable: Vec<String> = live
                .iter()
                .filter(|c| !is_available(c))
                .map(|c| component_short_name(&cluster_name, &c.name_any()))
                .collect();
            if unavailable.is_empty() {
                set_cluster_condition(
                    ctx,
                    CONDITION_AVAILABLE,
                    ConditionStatus::True,
                    REASON_AVAILABLE,
                    "all components are available",
                );
            } else {
                set_cluster_condition(
                    ctx,
                    CONDITION_AVAILABLE,
                    ConditionStatus::False,
                    REASON_UNAVAILABLE,
                    format!("the following components are not available: {:?}", unavailable),
                );
            }
        }
        Ok(())
    }
}

fn component_statuses(
    ctx: &TransformContext,
    running: &[&Component],
    generation: i64,
) -> BTreeMap<String, ClusterComponentStatus> {
    let cluster_name = ctx.cluster_name();
    let by_name: BTreeMap<String, &Component> = running
        .iter()
        .map(|c| (component_short_name(&cluster_name, &c.name_any()), *c))
        .collect();

    ctx.components
        .iter()
        .map(|spec| {
            let status = match by_name.get(&spec.name) {
                Some(comp) => ClusterComponentStatus {
                    phase: observed_phase(comp, generation),
                    message: comp.status.as_ref().map(|s| s.message.clone()).unwrap_or_default(),
                },
                None => ClusterComponentStatus::default(),
            };
            (spec.name.clone(), status)
        })
        .collect()
}

fn sharding_statuses(
    ctx: &TransformContext,
    running: &[&Component],
    generation: i64,
) -> BTreeMap<String, ClusterShardingStatus> {
    let cluster_name = ctx.cluster_name();
    let previous = ctx
        .cluster
        .status
        .as_ref()
        .map(|s| s.shardings.clone())
        .unwrap_or_default();

    let mut by_sharding: BTreeMap<&str, Vec<&Component>> = BTreeMap::new();
    for comp in running.iter().copied() {
        if let Some(sharding) = comp.sharding_name() {
            by_sharding.entry(sharding).or_default().push(comp);
        }
    }

    // removed shardings keep their entry while shards remain, so the
    // pre-terminate progress is not lost
    let names: BTreeSet<&str> = ctx
        .shardings
        .iter()
        .map(|s| s.name.as_str())
        .chain(by_sharding.keys().copied())
        .collect();

    names
        .into_iter()
        .map(|name| {
            let shards = by_sharding.get(name).map(Vec::as_slice).unwrap_or_default();
            let mut status = previous.get(name).cloned().unwrap_or_default();

            let phases: Vec<Option<ComponentPhase>> =
                shards.iter().map(|c| observed_phase(c, generation)).collect();
            status.phase = compose_sharding_phase(&phases);
            status.message = shards
                .iter()
                .filter_map(|c| {
                    let message = &c.status.as_ref()?.message;
                    let shard = component_short_name(&cluster_name, &c.name_any());
                    Some(message.iter().map(move |(k, v)| (format!("{}/{}", shard, k), v.clone())))
                })
                .flatten()
                .collect();
            if let Some(def) = ctx
                .shardings
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.sharding_def.clone())
                .filter(|d| !d.is_empty())
            {
                status.sharding_def = Some(def);
            }
            (name.to_string(), status)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{comp_spec, running_component, running_shard, sample_cluster, Fixtures};
    use kubeblocks_common::crd::{
        ActionPhase, ClusterSharding, ClusterStatus, Condition, LifecycleActionStatus,
    };

    // =========================================================================
    // Phase composition
    // =========================================================================

    mod composition {
        use super::*;
        use ComponentPhase::*;

        const ALL: [Option<ComponentPhase>; 10] = [
            None,
            Some(Creating),
            Some(Starting),
            Some(Running),
            Some(Updating),
            Some(Stopping),
            Some(Stopped),
            Some(Failed),
            Some(Abnormal),
            Some(Deleting),
        ];

        fn compose(phases: &[Option<ComponentPhase>]) -> Option<ClusterPhase> {
            compose_cluster_phase(phases)
        }

        #[test]
        fn test_empty_keeps_phase() {
            assert_eq!(compose(&[]), None);
        }

        #[test]
        fn test_rules_in_order() {
            assert_eq!(compose(&[Some(Stopped), Some(Stopped)]), Some(ClusterPhase::Stopped));
            assert_eq!(compose(&[Some(Running), Some(Stopped)]), Some(ClusterPhase::Running));
            assert_eq!(compose(&[None, Some(Creating)]), Some(ClusterPhase::Creating));
            assert_eq!(compose(&[Some(Creating), Some(Running)]), Some(ClusterPhase::Updating));
            assert_eq!(compose(&[Some(Starting), Some(Failed)]), Some(ClusterPhase::Updating));
            assert_eq!(compose(&[Some(Stopping), Some(Failed)]), Some(ClusterPhase::Stopping));
            assert_eq!(compose(&[Some(Failed), Some(Failed)]), Some(ClusterPhase::Failed));
            assert_eq!(compose(&[Some(Running), Some(Failed)]), Some(ClusterPhase::Abnormal));
            assert_eq!(compose(&[Some(Running), None]), None);
            assert_eq!(compose(&[Some(Deleting)]), None);
        }

        #[test]
        fn test_earlier_rules_shadow_later_ones() {
            // all Stopped also satisfies "all Running or Stopped"
            assert_eq!(compose(&[Some(Stopped)]), Some(ClusterPhase::Stopped));
            // all Creating also satisfies the Updating set
            assert_eq!(compose(&[Some(Creating)]), Some(ClusterPhase::Creating));
            // all Failed also satisfies "any Failed"
            assert_eq!(compose(&[Some(Failed)]), Some(ClusterPhase::Failed));
        }

        #[test]
        fn test_every_combination_is_consistent() {
            for a in ALL {
                for b in ALL {
                    for c in ALL {
                        let phases = [a, b, c];
                        let has = |p| phases.contains(&Some(p));
                        match compose(&phases) {
                            Some(ClusterPhase::Stopped) => {
                                assert!(phases.iter().all(|p| *p == Some(Stopped)))
                            }
                            Some(ClusterPhase::Abnormal) => {
                                assert!(has(Failed));
                                assert!(!phases.iter().all(|p| *p == Some(Failed)));
                                assert!(!has(Stopping) && !has(Starting));
                            }
                            Some(ClusterPhase::Stopping) => {
                                assert!(has(Stopping) && !has(Starting))
                            }
                            Some(ClusterPhase::Deleting) => panic!("never composed"),
                            None => assert!(!has(Failed) && !has(Stopping) && !has(Starting)),
                            Some(_) => {}
                        }
                    }
                }
            }
        }

        #[test]
        fn test_sharding_collapses_abnormal() {
            assert_eq!(
                compose_sharding_phase(&[Some(Running), Some(Failed)]),
                Some(Failed)
            );
            assert_eq!(compose_sharding_phase(&[Some(Running)]), Some(Running));
            assert_eq!(compose_sharding_phase(&[]), None);
        }
    }

    // =========================================================================
    // Transformer
    // =========================================================================

    mod aggregation {
        use super::*;
        use kubeblocks_common::events::RecordingEventPublisher;
        use std::sync::Arc;

        fn with_available(mut comp: Component, available: bool) -> Component {
            let status = if available {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            };
            comp.status
                .get_or_insert_with(Default::default)
                .conditions
                .push(Condition::new(CONDITION_AVAILABLE, status, "R", ""));
            comp
        }

        fn context(
            components: Vec<Component>,
            specs: &[&str],
        ) -> (TransformContext, Arc<RecordingEventPublisher>) {
            let fixtures = Fixtures {
                components,
                ..Default::default()
            };
            let (mut ctx, events) = fixtures.context_with(sample_cluster(), Default::default());
            ctx.components = specs.iter().map(|n| comp_spec(n, "mysql")).collect();
            (ctx, events)
        }

        #[tokio::test]
        async fn test_running_cluster_becomes_ready() {
            let (mut ctx, events) = context(
                vec![
                    with_available(running_component("comp1", "mysql", ComponentPhase::Running), true),
                    with_available(running_component("comp2", "mysql", ComponentPhase::Running), true),
                ],
                &["comp1", "comp2"],
            );

            StatusTransformer.transform(&mut ctx).await.unwrap();

            let status = ctx.cluster.status.as_ref().unwrap();
            assert_eq!(status.phase, Some(ClusterPhase::Running));
            assert_eq!(status.observed_generation, Some(1));
            assert!(find_condition(&status.conditions, CONDITION_READY).unwrap().is_true());
            assert!(find_condition(&status.conditions, CONDITION_AVAILABLE).unwrap().is_true());
            assert!(find_condition(&status.conditions, CONDITION_APPLY_RESOURCES)
                .unwrap()
                .is_true());
            assert!(events.has_reason(reasons::CLUSTER_READY));
        }

        #[tokio::test]
        async fn test_ready_only_on_transition() {
            let (mut ctx, events) = context(
                vec![running_component("comp1", "mysql", ComponentPhase::Running)],
                &["comp1"],
            );
            ctx.orig_cluster.status = Some(ClusterStatus {
                phase: Some(ClusterPhase::Running),
                ..Default::default()
            });

            StatusTransformer.transform(&mut ctx).await.unwrap();
            assert!(!events.has_reason(reasons::CLUSTER_READY));
        }

        #[tokio::test]
        async fn test_stale_component_counts_as_unknown() {
            let mut stale = running_component("comp2", "mysql", ComponentPhase::Failed);
            stale.metadata.generation = Some(2);
            let (mut ctx, _) = context(
                vec![
                    running_component("comp1", "mysql", ComponentPhase::Running),
                    stale,
                ],
                &["comp1", "comp2"],
            );
            ctx.cluster.status = Some(ClusterStatus {
                phase: Some(ClusterPhase::Updating),
                ..Default::default()
            });

            StatusTransformer.transform(&mut ctx).await.unwrap();
            let status = ctx.cluster.status.as_ref().unwrap();
            assert_eq!(status.components["comp2"].phase, None);
            assert_eq!(status.phase, Some(ClusterPhase::Updating));
        }

        #[tokio::test]
        async fn test_failed_component_names_every_failure() {
            let (mut ctx, events) = context(
                vec![
                    running_component("comp1", "mysql", ComponentPhase::Failed),
                    running_component("comp2", "mysql", ComponentPhase::Running),
                    running_shard("shard", "abc", "mysql", None),
                ],
                &["comp1", "comp2"],
            );

            StatusTransformer.transform(&mut ctx).await.unwrap();
            let status = ctx.cluster.status.as_ref().unwrap();
            assert_eq!(status.phase, Some(ClusterPhase::Abnormal));
            let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
            assert_eq!(ready.status, ConditionStatus::False);
            assert!(ready.message.contains("comp1"));
            assert!(!ready.message.contains("comp2"));
            assert!(events.has_reason(reasons::COMPONENTS_NOT_READY));
            // no shard reports availability
            let available = find_condition(&status.conditions, CONDITION_AVAILABLE).unwrap();
            assert_eq!(available.status, ConditionStatus::False);
        }

        #[tokio::test]
        async fn test_sharding_is_one_virtual_component() {
            let mut failed = running_shard("shard", "def", "mysql", None);
            failed.status.as_mut().unwrap().phase = Some(ComponentPhase::Failed);
            let (mut ctx, _) = context(
                vec![running_shard("shard", "abc", "mysql", None), failed],
                &[],
            );
            ctx.shardings = vec![ClusterSharding {
                name: "shard".to_string(),
                sharding_def: "mysql-shard".to_string(),
                shards: 2,
                ..Default::default()
            }];

            StatusTransformer.transform(&mut ctx).await.unwrap();
            let status = ctx.cluster.status.as_ref().unwrap();
            let sharding = &status.shardings["shard"];
            assert_eq!(sharding.phase, Some(ComponentPhase::Failed));
            assert_eq!(sharding.sharding_def.as_deref(), Some("mysql-shard"));
            // a failed sharding alone is a failed cluster
            assert_eq!(status.phase, Some(ClusterPhase::Failed));
        }

        #[tokio::test]
        async fn test_removed_sharding_kept_while_shards_run() {
            let (mut ctx, _) = context(vec![running_shard("old", "abc", "mysql", None)], &[]);
            ctx.cluster.status = Some(ClusterStatus {
                shardings: BTreeMap::from([
                    (
                        "old".to_string(),
                        ClusterShardingStatus {
                            pre_terminate: Some(LifecycleActionStatus::with_phase(
                                ActionPhase::Succeeded,
                            )),
                            ..Default::default()
                        },
                    ),
                    ("gone".to_string(), ClusterShardingStatus::default()),
                ]),
                ..Default::default()
            });

            StatusTransformer.transform(&mut ctx).await.unwrap();
            let shardings = &ctx.cluster.status.as_ref().unwrap().shardings;
            assert_eq!(shardings.keys().collect::<Vec<_>>(), vec!["old"]);
            assert!(shardings["old"].pre_terminate.is_some());
        }

        #[tokio::test]
        async fn test_deleting_cluster_only_sets_phase() {
            let mut cluster = sample_cluster();
            cluster.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
            );
            let mut ctx = Fixtures::default().context(cluster);

            StatusTransformer.transform(&mut ctx).await.unwrap();
            let status = ctx.cluster.status.as_ref().unwrap();
            assert_eq!(status.phase, Some(ClusterPhase::Deleting));
            assert!(status.conditions.is_empty());
        }
    }
}
