//! Sharding-level lifecycle actions
//!
//! PostProvision and PreTerminate run once per sharding and their progress is
//! persisted in the sharding's status entry, so a pass that ends early picks
//! up where the last one stopped. ShardAdd and ShardRemove run per shard and
//! track progress with annotations on the shard Component itself.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use kube::runtime::events::EventType;
use kube::ResourceExt;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use kubeblocks_common::constants::{
    ACTION_POST_PROVISION, ACTION_PRE_TERMINATE, ACTION_SHARD_ADD, ACTION_SHARD_REMOVE,
    ADD_SHARD_NAME_VAR, REMOVE_SHARD_NAME_VAR, SHARDING_ADD_ANNOTATION, SHARDING_NAME_LABEL,
    SHARDING_REMOVE_DONE_ANNOTATION,
};
use kubeblocks_common::crd::{
    ActionPhase, ClusterShardingStatus, Component, LifecycleActionStatus, ShardingAction,
    ShardingDefinition, ShardingLifecycleActions, TargetShard,
};
use kubeblocks_common::events::{actions, reasons};
use kubeblocks_common::{Error, Result};

use super::status_mut;
use crate::builder::cluster_labels;
use crate::context::TransformContext;
use crate::lifecycle::ActionOptions;

const POST_PROVISION_REQUEUE: Duration = Duration::from_secs(3);
const PRE_TERMINATE_REQUEUE: Duration = Duration::from_secs(1);
const PRECONDITION_REQUEUE: Duration = Duration::from_secs(10);

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn sharding_status<'a>(ctx: &'a mut TransformContext, sharding: &str) -> &'a mut ClusterShardingStatus {
    status_mut(ctx).shardings.entry(sharding.to_string()).or_default()
}

fn current_status(ctx: &TransformContext, sharding: &str) -> Option<ClusterShardingStatus> {
    ctx.cluster
        .status
        .as_ref()
        .and_then(|s| s.shardings.get(sharding))
        .cloned()
}

/// Lifecycle actions of the sharding's resolved definition, empty if it has none
fn desired_actions(ctx: &TransformContext, sharding: &str) -> ShardingLifecycleActions {
    ctx.shardings
        .iter()
        .find(|s| s.name == sharding)
        .filter(|s| !s.sharding_def.is_empty())
        .and_then(|s| ctx.sharding_defs.get(&s.sharding_def))
        .map(ShardingDefinition::lifecycle_actions)
        .unwrap_or_default()
}

/// Lifecycle actions of the definition recorded in the sharding's status
///
/// Used on the termination path, where the sharding may already be gone
/// from the spec.
async fn recorded_actions(ctx: &TransformContext, sharding: &str) -> Result<ShardingLifecycleActions> {
    let def_name = current_status(ctx, sharding)
        .and_then(|s| s.sharding_def)
        .filter(|d| !d.is_empty());
    let Some(def_name) = def_name else {
        return Ok(ShardingLifecycleActions::default());
    };
    Ok(ctx
        .store
        .get_sharding_definition(&def_name)
        .await?
        .map(|d| d.lifecycle_actions())
        .unwrap_or_default())
}

fn defined(action: &Option<ShardingAction>) -> Option<&ShardingAction> {
    action.as_ref().filter(|a| a.action.exec.is_some())
}

/// Shards an action runs on
///
/// `AllShards` targets every shard; `AnyShard` targets `preferred` when given
/// and a random shard otherwise.
pub fn select_target_shards(
    action: &ShardingAction,
    shards: &[Component],
    preferred: Option<&Component>,
    rng: &mut impl rand::Rng,
) -> Result<Vec<Component>> {
    match action.target_shard.unwrap_or_default() {
        TargetShard::AllShards => {
            if shards.is_empty() {
                return Err(Error::internal("the sharding has no shards to run the action"));
            }
            Ok(shards.to_vec())
        }
        TargetShard::AnyShard => {
            if let Some(shard) = preferred {
                return Ok(vec![shard.clone()]);
            }
            shards
                .choose(rng)
                .map(|s| vec![s.clone()])
                .ok_or_else(|| Error::internal("the sharding has no shards to run the action"))
        }
    }
}

/// Run a sharding action on its target shards
async fn run_action(
    ctx: &mut TransformContext,
    sharding: &str,
    name: &str,
    action: &ShardingAction,
    args: BTreeMap<String, String>,
    shards: &[Component],
    preferred: Option<&Component>,
) -> Result<()> {
    let targets = select_target_shards(action, shards, preferred, &mut ctx.rng)
        .map_err(|e| Error::action(name, format!("sharding {}: {}", sharding, e)))?;

    let mut selector = cluster_labels(&ctx.cluster_name());
    selector.insert(SHARDING_NAME_LABEL.to_string(), sharding.to_string());

    for target in targets {
        let options = ActionOptions {
            namespace: ctx.namespace(),
            cluster: ctx.cluster_name(),
            component: target.name_any(),
            comp_def: target.spec.comp_def.clone(),
            selector: selector.clone(),
        };
        debug!(sharding, action = name, shard = %options.component, "running sharding action");
        ctx.lifecycle
            .user_defined(&options, name, &action.action, &args)
            .await
            .map_err(|e| {
                if e.is_action_precondition_failed() {
                    Error::delayed_requeue(PRECONDITION_REQUEUE, e.to_string())
                } else {
                    e
                }
            })?;
    }
    Ok(())
}

fn skipped(message: &str) -> LifecycleActionStatus {
    let now = Utc::now();
    LifecycleActionStatus {
        phase: ActionPhase::Skipped,
        message: Some(message.to_string()),
        start_time: Some(now),
        completion_time: Some(now),
    }
}

fn pending() -> LifecycleActionStatus {
    LifecycleActionStatus {
        start_time: Some(Utc::now()),
        ..LifecycleActionStatus::with_phase(ActionPhase::Pending)
    }
}

fn finished(previous: Option<LifecycleActionStatus>, result: &Result<()>) -> LifecycleActionStatus {
    let start_time = previous.and_then(|p| p.start_time);
    match result {
        Ok(()) => LifecycleActionStatus {
            phase: ActionPhase::Succeeded,
            message: None,
            start_time,
            completion_time: Some(Utc::now()),
        },
        Err(err) => LifecycleActionStatus {
            phase: ActionPhase::Failed,
            message: Some(err.to_string()),
            start_time,
            completion_time: None,
        },
    }
}

async fn action_failed(ctx: &TransformContext, sharding: &str, name: &str, err: &Error) {
    if err.requeue_after().is_some() {
        debug!(sharding, action = name, reason = %err, "sharding action deferred");
        return;
    }
    warn!(sharding, action = name, error = %err, "sharding action failed");
    ctx.event(
        EventType::Warning,
        reasons::SHARDING_ACTION_FAILED,
        actions::RECONCILE,
        format!("{} of sharding {} failed: {}", name, sharding, err),
    )
    .await;
}

/// Drive the PostProvision action of a sharding
///
/// The first call only marks the action Pending and asks for a requeue, so
/// the shards are created before anything runs against them.
pub async fn handle_post_provision(
    ctx: &mut TransformContext,
    sharding: &str,
    shards: &[Component],
) -> Result<()> {
    let actions = desired_actions(ctx, sharding);
    let current = current_status(ctx, sharding).and_then(|s| s.post_provision);

    let Some(action) = defined(&actions.post_provision) else {
        if current.is_none() {
            sharding_status(ctx, sharding).post_provision =
                Some(skipped("the PostProvision action is not defined"));
        }
        return Ok(());
    };
    match &current {
        Some(status) if status.phase.is_done() => return Ok(()),
        None => {
            sharding_status(ctx, sharding).post_provision = Some(pending());
            return Err(Error::delayed_requeue(
                POST_PROVISION_REQUEUE,
                "requeue to schedule the sharding post-provision action",
            ));
        }
        Some(_) => {}
    }

    let result = run_action(ctx, sharding, ACTION_POST_PROVISION, action, BTreeMap::new(), shards, None).await;
    let status = finished(current, &result);
    match &result {
        Ok(()) => info!(sharding, "post-provision action succeeded"),
        Err(err) => action_failed(ctx, sharding, ACTION_POST_PROVISION, err).await,
    }
    sharding_status(ctx, sharding).post_provision = Some(status);
    result
}

/// Drive the PreTerminate action of a sharding
///
/// Skipped when PostProvision is declared but never completed: a sharding
/// that was never fully provisioned has nothing to hand over.
pub async fn handle_pre_terminate(
    ctx: &mut TransformContext,
    sharding: &str,
    shards: &[Component],
) -> Result<()> {
    let actions = recorded_actions(ctx, sharding).await?;
    let status = current_status(ctx, sharding).unwrap_or_default();
    let current = status.pre_terminate.clone();

    let Some(action) = defined(&actions.pre_terminate) else {
        if current.is_none() {
            sharding_status(ctx, sharding).pre_terminate =
                Some(skipped("the PreTerminate action is not defined"));
        }
        return Ok(());
    };
    if current.as_ref().is_some_and(|s| s.phase.is_done()) {
        return Ok(());
    }
    if status
        .post_provision
        .as_ref()
        .is_some_and(|p| !p.phase.is_done())
    {
        sharding_status(ctx, sharding).pre_terminate =
            Some(skipped("the PostProvision action is not succeeded"));
        return Ok(());
    }
    if current.is_none() {
        sharding_status(ctx, sharding).pre_terminate = Some(pending());
        return Err(Error::delayed_requeue(
            PRE_TERMINATE_REQUEUE,
            "requeue to schedule the sharding pre-terminate action",
        ));
    }

    let result = run_action(ctx, sharding, ACTION_PRE_TERMINATE, action, BTreeMap::new(), shards, None).await;
    let status = finished(current, &result);
    if let Err(err) = &result {
        action_failed(ctx, sharding, ACTION_PRE_TERMINATE, err).await;
    }
    sharding_status(ctx, sharding).pre_terminate = Some(status);
    result
}

/// Mark newly created shards for the ShardAdd action
pub fn mark_shards_to_add(ctx: &TransformContext, sharding: &str, protos: &mut [&mut Component]) {
    if defined(&desired_actions(ctx, sharding).shard_add).is_none() {
        return;
    }
    let now = now_rfc3339();
    for proto in protos.iter_mut() {
        proto
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(SHARDING_ADD_ANNOTATION.to_string(), now.clone());
    }
}

fn add_pending(shard: &Component) -> bool {
    shard
        .annotation(SHARDING_ADD_ANNOTATION)
        .is_some_and(|v| !v.is_empty())
}

/// Run ShardRemove for the shards leaving and ShardAdd for the shards staying
///
/// Returns the shards whose ShardAdd completed in this pass; their marker
/// annotation must be dropped by the caller's update. The first error wins,
/// with removals reported before additions.
pub async fn handle_shard_add_and_remove(
    ctx: &mut TransformContext,
    sharding: &str,
    running: &[Component],
    to_delete: &BTreeSet<String>,
    to_update: &BTreeSet<String>,
) -> Result<BTreeSet<String>> {
    let mut remove_err = None;
    for name in to_delete {
        let Some(shard) = running.iter().find(|c| &c.name_any() == name) else {
            continue;
        };
        if let Err(err) = handle_shard_remove(ctx, sharding, running, shard).await {
            remove_err.get_or_insert(err);
        }
    }

    let mut added = BTreeSet::new();
    let mut add_err = None;
    for name in to_update {
        let Some(shard) = running.iter().find(|c| &c.name_any() == name) else {
            continue;
        };
        match handle_shard_add(ctx, sharding, running, shard).await {
            Ok(true) => {
                added.insert(name.clone());
            }
            Ok(false) => {}
            Err(err) => {
                add_err.get_or_insert(err);
            }
        }
    }

    match remove_err.or(add_err) {
        Some(err) => Err(err),
        None => Ok(added),
    }
}

/// Run ShardAdd for a shard still carrying the marker annotation
///
/// Returns true when the action ran and succeeded in this pass.
async fn handle_shard_add(
    ctx: &mut TransformContext,
    sharding: &str,
    running: &[Component],
    shard: &Component,
) -> Result<bool> {
    if !add_pending(shard) {
        return Ok(false);
    }
    let actions = desired_actions(ctx, sharding);
    let Some(action) = defined(&actions.shard_add) else {
        return Err(Error::action(
            ACTION_SHARD_ADD,
            format!(
                "shard {} is waiting for the ShardAdd action, but sharding {} does not define it",
                shard.name_any(),
                sharding
            ),
        ));
    };

    let args = BTreeMap::from([(ADD_SHARD_NAME_VAR.to_string(), shard.name_any())]);
    run_action(ctx, sharding, ACTION_SHARD_ADD, action, args, running, Some(shard)).await?;
    info!(sharding, shard = %shard.name_any(), "shard added");
    Ok(true)
}

/// Run ShardRemove for a shard leaving the sharding
///
/// A shard may only be deleted once this returns `Ok`. After the action
/// succeeds the shard is marked and the deletion waits for the next pass.
async fn handle_shard_remove(
    ctx: &mut TransformContext,
    sharding: &str,
    running: &[Component],
    shard: &Component,
) -> Result<()> {
    if shard.annotation(SHARDING_REMOVE_DONE_ANNOTATION).is_some() {
        return Ok(());
    }
    let actions = desired_actions(ctx, sharding);
    let Some(action) = defined(&actions.shard_remove) else {
        return Ok(());
    };
    if defined(&actions.shard_add).is_some() && add_pending(shard) {
        return Err(Error::delayed_requeue(
            PRECONDITION_REQUEUE,
            format!(
                "the ShardAdd action of shard {} is not done yet, waiting for it before removing",
                shard.name_any()
            ),
        ));
    }

    let args = BTreeMap::from([(REMOVE_SHARD_NAME_VAR.to_string(), shard.name_any())]);
    run_action(ctx, sharding, ACTION_SHARD_REMOVE, action, args, running, Some(shard)).await?;

    let mut done = shard.clone();
    done.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SHARDING_REMOVE_DONE_ANNOTATION.to_string(), now_rfc3339());
    ctx.graph.update_component(done);
    info!(sharding, shard = %shard.name_any(), "shard removed, deleting in the next pass");
    Err(Error::requeue(format!(
        "shard {} removed from sharding {}, requeue to delete it",
        shard.name_any(),
        sharding
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::MockLifecycleActions;
    use crate::testing::{running_shard, sample_cluster, sharding_def, Fixtures};
    use kubeblocks_common::crd::{
        Action, ClusterComponentSpec, ClusterSharding, ClusterStatus, ExecAction,
    };
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn action(target: Option<TargetShard>) -> ShardingAction {
        ShardingAction {
            action: Action {
                exec: Some(ExecAction {
                    command: vec!["/scripts/hook.sh".to_string()],
                    ..Default::default()
                }),
                ..Default::default()
            },
            target_shard: target,
        }
    }

    fn def_with(actions: ShardingLifecycleActions) -> ShardingDefinition {
        let mut def = sharding_def("redis-sharding", "redis-7");
        def.spec.lifecycle_actions = Some(actions);
        def
    }

    fn shards() -> Vec<Component> {
        vec![
            running_shard("shard", "abc", "redis-7", None),
            running_shard("shard", "def", "redis-7", None),
        ]
    }

    /// A context whose sharding resolves to `def`
    fn context(
        def: ShardingDefinition,
        lifecycle: MockLifecycleActions,
    ) -> TransformContext {
        let fixtures = Fixtures {
            sharding_defs: vec![def.clone()],
            components: shards(),
            ..Default::default()
        };
        let (mut ctx, _) = fixtures.context_with(sample_cluster(), lifecycle);
        ctx.shardings = vec![ClusterSharding {
            name: "shard".to_string(),
            sharding_def: def.name_any(),
            template: ClusterComponentSpec::default(),
            shards: 2,
            ..Default::default()
        }];
        ctx.sharding_defs.insert(def.name_any(), def);
        ctx
    }

    fn post_provision_phase(ctx: &TransformContext) -> Option<ActionPhase> {
        current_status(ctx, "shard")
            .and_then(|s| s.post_provision)
            .map(|s| s.phase)
    }

    // =========================================================================
    // Target selection
    // =========================================================================

    mod targets {
        use super::*;

        #[test]
        fn test_all_shards() {
            let mut rng = StdRng::seed_from_u64(1);
            let targets =
                select_target_shards(&action(Some(TargetShard::AllShards)), &shards(), None, &mut rng)
                    .unwrap();
            assert_eq!(targets.len(), 2);
        }

        #[test]
        fn test_any_shard_prefers_given() {
            let all = shards();
            let mut rng = StdRng::seed_from_u64(1);
            let targets = select_target_shards(&action(None), &all, Some(&all[1]), &mut rng).unwrap();
            assert_eq!(targets.len(), 1);
            assert_eq!(targets[0].name_any(), "mycluster-shard-def");
        }

        #[test]
        fn test_any_shard_picks_one() {
            let mut rng = StdRng::seed_from_u64(1);
            let targets = select_target_shards(&action(None), &shards(), None, &mut rng).unwrap();
            assert_eq!(targets.len(), 1);
        }

        #[test]
        fn test_no_shards_is_an_error() {
            let mut rng = StdRng::seed_from_u64(1);
            assert!(select_target_shards(&action(None), &[], None, &mut rng).is_err());
            assert!(
                select_target_shards(&action(Some(TargetShard::AllShards)), &[], None, &mut rng)
                    .is_err()
            );
        }
    }

    // =========================================================================
    // PostProvision
    // =========================================================================

    mod post_provision {
        use super::*;

        #[tokio::test]
        async fn test_undefined_is_skipped() {
            let mut ctx = context(def_with(Default::default()), MockLifecycleActions::new());
            handle_post_provision(&mut ctx, "shard", &shards()).await.unwrap();

            let status = current_status(&ctx, "shard").unwrap().post_provision.unwrap();
            assert_eq!(status.phase, ActionPhase::Skipped);
            assert_eq!(status.message.as_deref(), Some("the PostProvision action is not defined"));
        }

        #[tokio::test]
        async fn test_first_pass_marks_pending_and_requeues() {
            let def = def_with(ShardingLifecycleActions {
                post_provision: Some(action(None)),
                ..Default::default()
            });
            let mut ctx = context(def, MockLifecycleActions::new());

            let err = handle_post_provision(&mut ctx, "shard", &[]).await.unwrap_err();
            assert_eq!(err.requeue_after(), Some(Duration::from_secs(3)));
            assert_eq!(post_provision_phase(&ctx), Some(ActionPhase::Pending));
        }

        #[tokio::test]
        async fn test_runs_once_pending() {
            let def = def_with(ShardingLifecycleActions {
                post_provision: Some(action(Some(TargetShard::AllShards))),
                ..Default::default()
            });
            let mut lifecycle = MockLifecycleActions::new();
            lifecycle
                .expect_user_defined()
                .times(2)
                .returning(|options, name, _, _| {
                    assert_eq!(name, ACTION_POST_PROVISION);
                    assert_eq!(options.selector[SHARDING_NAME_LABEL], "shard");
                    Ok(())
                });
            let mut ctx = context(def, lifecycle);
            sharding_status(&mut ctx, "shard").post_provision = Some(pending());

            handle_post_provision(&mut ctx, "shard", &shards()).await.unwrap();
            assert_eq!(post_provision_phase(&ctx), Some(ActionPhase::Succeeded));

            // done: nothing runs again
            handle_post_provision(&mut ctx, "shard", &shards()).await.unwrap();
        }

        #[tokio::test]
        async fn test_failure_is_recorded() {
            let def = def_with(ShardingLifecycleActions {
                post_provision: Some(action(None)),
                ..Default::default()
            });
            let mut lifecycle = MockLifecycleActions::new();
            lifecycle
                .expect_user_defined()
                .returning(|_, name, _, _| Err(Error::action(name, "exit code 1")));
            let mut ctx = context(def, lifecycle);
            sharding_status(&mut ctx, "shard").post_provision = Some(pending());

            assert!(handle_post_provision(&mut ctx, "shard", &shards()).await.is_err());
            let status = current_status(&ctx, "shard").unwrap().post_provision.unwrap();
            assert_eq!(status.phase, ActionPhase::Failed);
            assert!(status.message.unwrap().contains("exit code 1"));
        }

        #[tokio::test]
        async fn test_precondition_failure_requeues_later() {
            let def = def_with(ShardingLifecycleActions {
                post_provision: Some(action(None)),
                ..Default::default()
            });
            let mut lifecycle = MockLifecycleActions::new();
            lifecycle
                .expect_user_defined()
                .returning(|_, name, _, _| Err(Error::action_precondition_failed(name, "not ready")));
            let mut ctx = context(def, lifecycle);
            sharding_status(&mut ctx, "shard").post_provision = Some(pending());

            let err = handle_post_provision(&mut ctx, "shard", &shards()).await.unwrap_err();
            assert_eq!(err.requeue_after(), Some(Duration::from_secs(10)));
        }
    }

    // =========================================================================
    // PreTerminate
    // =========================================================================

    mod pre_terminate {
        use super::*;

        fn with_recorded_def(ctx: &mut TransformContext, post_provision: Option<ActionPhase>) {
            let entry = sharding_status(ctx, "shard");
            entry.sharding_def = Some("redis-sharding".to_string());
            entry.post_provision = post_provision.map(LifecycleActionStatus::with_phase);
        }

        #[tokio::test]
        async fn test_skipped_when_post_provision_not_done() {
            let def = def_with(ShardingLifecycleActions {
                post_provision: Some(action(None)),
                pre_terminate: Some(action(None)),
                ..Default::default()
            });
            let mut ctx = context(def, MockLifecycleActions::new());
            with_recorded_def(&mut ctx, Some(ActionPhase::Failed));

            handle_pre_terminate(&mut ctx, "shard", &shards()).await.unwrap();
            let status = current_status(&ctx, "shard").unwrap().pre_terminate.unwrap();
            assert_eq!(status.phase, ActionPhase::Skipped);
            assert_eq!(
                status.message.as_deref(),
                Some("the PostProvision action is not succeeded")
            );
        }

        #[tokio::test]
        async fn test_pending_then_runs() {
            let def = def_with(ShardingLifecycleActions {
                post_provision: Some(action(None)),
                pre_terminate: Some(action(None)),
                ..Default::default()
            });
            let mut lifecycle = MockLifecycleActions::new();
            lifecycle
                .expect_user_defined()
                .times(1)
                .returning(|_, name, _, _| {
                    assert_eq!(name, ACTION_PRE_TERMINATE);
                    Ok(())
                });
            let mut ctx = context(def, lifecycle);
            with_recorded_def(&mut ctx, Some(ActionPhase::Succeeded));

            let err = handle_pre_terminate(&mut ctx, "shard", &shards()).await.unwrap_err();
            assert_eq!(err.requeue_after(), Some(Duration::from_secs(1)));

            handle_pre_terminate(&mut ctx, "shard", &shards()).await.unwrap();
            let status = current_status(&ctx, "shard").unwrap().pre_terminate.unwrap();
            assert_eq!(status.phase, ActionPhase::Succeeded);
        }

        #[tokio::test]
        async fn test_without_recorded_definition_is_skipped() {
            let mut ctx = context(def_with(Default::default()), MockLifecycleActions::new());
            ctx.cluster.status = Some(ClusterStatus::default());

            handle_pre_terminate(&mut ctx, "shard", &shards()).await.unwrap();
            let status = current_status(&ctx, "shard").unwrap().pre_terminate.unwrap();
            assert_eq!(status.phase, ActionPhase::Skipped);
        }
    }

    // =========================================================================
    // ShardAdd / ShardRemove
    // =========================================================================

    mod shard_add_remove {
        use super::*;

        fn names(names: &[&str]) -> BTreeSet<String> {
            names.iter().map(|s| s.to_string()).collect()
        }

        fn marked(mut shard: Component) -> Component {
            shard
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(SHARDING_ADD_ANNOTATION.to_string(), now_rfc3339());
            shard
        }

        #[test]
        fn test_marks_only_when_defined() {
            let mut proto = running_shard("shard", "xyz", "redis-7", None);

            let ctx = context(def_with(Default::default()), MockLifecycleActions::new());
            mark_shards_to_add(&ctx, "shard", &mut [&mut proto]);
            assert!(!add_pending(&proto));

            let ctx = context(
                def_with(ShardingLifecycleActions {
                    shard_add: Some(action(None)),
                    ..Default::default()
                }),
                MockLifecycleActions::new(),
            );
            mark_shards_to_add(&ctx, "shard", &mut [&mut proto]);
            assert!(add_pending(&proto));
        }

        #[tokio::test]
        async fn test_add_runs_against_the_new_shard() {
            let def = def_with(ShardingLifecycleActions {
                shard_add: Some(action(None)),
                ..Default::default()
            });
            let mut lifecycle = MockLifecycleActions::new();
            lifecycle
                .expect_user_defined()
                .times(1)
                .returning(|options, _, _, args| {
                    assert_eq!(options.component, "mycluster-shard-def");
                    assert_eq!(args[ADD_SHARD_NAME_VAR], "mycluster-shard-def");
                    Ok(())
                });
            let mut ctx = context(def, lifecycle);
            let running = vec![
                running_shard("shard", "abc", "redis-7", None),
                marked(running_shard("shard", "def", "redis-7", None)),
            ];

            let added = handle_shard_add_and_remove(
                &mut ctx,
                "shard",
                &running,
                &BTreeSet::new(),
                &names(&["mycluster-shard-abc", "mycluster-shard-def"]),
            )
            .await
            .unwrap();
            assert_eq!(added, names(&["mycluster-shard-def"]));
        }

        #[tokio::test]
        async fn test_marker_without_action_is_an_error() {
            let mut ctx = context(def_with(Default::default()), MockLifecycleActions::new());
            let running = vec![marked(running_shard("shard", "abc", "redis-7", None))];

            let err = handle_shard_add_and_remove(
                &mut ctx,
                "shard",
                &running,
                &BTreeSet::new(),
                &names(&["mycluster-shard-abc"]),
            )
            .await
            .unwrap_err();
            assert!(!err.is_requeue());
        }

        #[tokio::test]
        async fn test_remove_marks_done_and_requeues() {
            let def = def_with(ShardingLifecycleActions {
                shard_remove: Some(action(None)),
                ..Default::default()
            });
            let mut lifecycle = MockLifecycleActions::new();
            lifecycle
                .expect_user_defined()
                .times(1)
                .returning(|_, _, _, args| {
                    assert_eq!(args[REMOVE_SHARD_NAME_VAR], "mycluster-shard-def");
                    Ok(())
                });
            let mut ctx = context(def, lifecycle);
            let running = shards();

            let err = handle_shard_add_and_remove(
                &mut ctx,
                "shard",
                &running,
                &names(&["mycluster-shard-def"]),
                &names(&["mycluster-shard-abc"]),
            )
            .await
            .unwrap_err();
            assert!(err.is_requeue());

            let updated = &ctx.graph.vertices()[0];
            let crate::dag::ClusterObject::Component(shard) = &updated.object else {
                panic!("expected a component");
            };
            assert!(shard.annotation(SHARDING_REMOVE_DONE_ANNOTATION).is_some());
        }

        #[tokio::test]
        async fn test_remove_done_lets_deletion_proceed() {
            let def = def_with(ShardingLifecycleActions {
                shard_remove: Some(action(None)),
                ..Default::default()
            });
            let mut ctx = context(def, MockLifecycleActions::new());
            let mut done = running_shard("shard", "def", "redis-7", None);
            done.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(SHARDING_REMOVE_DONE_ANNOTATION.to_string(), now_rfc3339());

            handle_shard_add_and_remove(
                &mut ctx,
                "shard",
                &[done],
                &names(&["mycluster-shard-def"]),
                &BTreeSet::new(),
            )
            .await
            .unwrap();
            assert!(ctx.graph.is_empty());
        }

        #[tokio::test]
        async fn test_remove_waits_for_pending_add() {
            let def = def_with(ShardingLifecycleActions {
                shard_add: Some(action(None)),
                shard_remove: Some(action(None)),
                ..Default::default()
            });
            let mut ctx = context(def, MockLifecycleActions::new());
            let running = vec![marked(running_shard("shard", "abc", "redis-7", None))];

            let err = handle_shard_add_and_remove(
                &mut ctx,
                "shard",
                &running,
                &names(&["mycluster-shard-abc"]),
                &BTreeSet::new(),
            )
            .await
            .unwrap_err();
            assert!(err.requeue_after().is_some());
            assert!(ctx.graph.is_empty());
        }
    }
}
