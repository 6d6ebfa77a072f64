//! Teardown of a cluster marked for deletion
//!
//! Components go first, in the topology's terminate order, then every owned
//! object the termination policy covers. The finalizer is released only once
//! nothing is left.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::info;

use kubeblocks_common::constants::{APP_INSTANCE_LABEL, CLUSTER_FINALIZER};
use kubeblocks_common::crd::{ClusterPhase, TerminationPolicy};
use kubeblocks_common::events::{actions, reasons};
use kubeblocks_common::{Error, Result};

use super::component::{handle_in_order, running_entities, Op, SidecarSource};
use super::{status_mut, Transformer};
use crate::context::TransformContext;
use crate::dag::{ClusterObject, Verb};
use crate::store::OwnedKind;

const DELETION_REQUEUE: Duration = Duration::from_secs(1);

/// Deletes the cluster's components and owned objects, then its finalizer
pub struct DeletionTransformer;

#[async_trait]
impl Transformer for DeletionTransformer {
    fn name(&self) -> &'static str {
        "deletion"
    }

    async fn transform(&self, ctx: &mut TransformContext) -> Result<()> {
        if !ctx.orig_cluster.is_deleting() {
            return Ok(());
        }
        let cluster = ctx.cluster_name();
        let policy = ctx.cluster.spec.termination_policy;
        let first_pass =
            ctx.orig_cluster.status.as_ref().and_then(|s| s.phase) != Some(ClusterPhase::Deleting);
        status_mut(ctx).phase = Some(ClusterPhase::Deleting);

        if policy == TerminationPolicy::DoNotTerminate {
            let message = format!(
                "spec.terminationPolicy {} is preventing deleting cluster {}",
                policy, cluster
            );
            status_mut(ctx).message = Some(message.clone());
            ctx.event(
                EventType::Warning,
                reasons::DELETION_BLOCKED,
                actions::DELETE,
                message,
            )
            .await;
            return Err(Error::PrematureStop);
        }
        if first_pass {
            ctx.event(
                EventType::Normal,
                reasons::DELETION_STARTED,
                actions::DELETE,
                format!("deleting cluster {} with terminationPolicy {}", cluster, policy),
            )
            .await;
        }

        let (running, _) = running_entities(ctx).await?;
        if !running.is_empty() {
            handle_in_order(ctx, &SidecarSource::default(), &running, Op::Delete, false).await?;
            return Err(Error::delayed_requeue(
                DELETION_REQUEUE,
                format!("waiting for the components of cluster {} to be deleted", cluster),
            ));
        }

        let namespace = ctx.namespace();
        let labels = BTreeMap::from([(APP_INSTANCE_LABEL.to_string(), cluster.clone())]);
        let mut remaining = 0;
        for kind in OwnedKind::for_policy(policy) {
            for name in ctx.store.list_owned(&namespace, *kind, &labels).await? {
                ctx.graph.add(
                    Verb::Delete,
                    ClusterObject::Owned {
                        kind: *kind,
                        namespace: namespace.clone(),
                        name,
                    },
                );
                remaining += 1;
            }
        }
        if remaining > 0 {
            return Err(Error::delayed_requeue(
                DELETION_REQUEUE,
                format!("waiting for {} objects of cluster {} to be deleted", remaining, cluster),
            ));
        }

        info!(cluster = %cluster, "all resources deleted, releasing the cluster");
        if let Some(finalizers) = ctx.cluster.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != CLUSTER_FINALIZER);
        }
        // the object is about to go away; a status write would only race it
        ctx.cluster.status = ctx.orig_cluster.status.clone();
        Err(Error::PrematureStop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cluster_def, comp_spec, running_component, sample_cluster, Fixtures};
    use crate::transformers::{run_pipeline, MetaTransformer};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::ResourceExt;
    use kubeblocks_common::crd::{
        Cluster, ClusterTopology, ClusterTopologyComponent, ClusterTopologyOrders, ComponentPhase,
    };

    fn deleting(policy: TerminationPolicy) -> Cluster {
        let mut cluster = sample_cluster();
        cluster.spec.termination_policy = policy;
        cluster.spec.cluster_def = "mysql-cluster".to_string();
        cluster.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        cluster.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
        cluster
    }

    fn terminate_ordered() -> ClusterTopology {
        ClusterTopology {
            name: "default".to_string(),
            components: ["comp1", "comp2", "comp3"]
                .iter()
                .map(|n| ClusterTopologyComponent {
                    name: n.to_string(),
                    comp_def: "mysql".to_string(),
                    template: None,
                })
                .collect(),
            orders: Some(ClusterTopologyOrders {
                terminate: vec!["comp1".to_string(), "comp2".to_string(), "comp3".to_string()],
                ..Default::default()
            }),
            default: true,
            ..Default::default()
        }
    }

    fn context(fixtures: &Fixtures, policy: TerminationPolicy) -> TransformContext {
        let mut ctx = fixtures.context(deleting(policy));
        ctx.cluster_def = Some(cluster_def("mysql-cluster", vec![terminate_ordered()]));
        ctx.components = vec![comp_spec("comp1", "mysql")];
        ctx
    }

    #[tokio::test]
    async fn test_not_deleting_is_a_no_op() {
        let mut ctx = Fixtures::default().context(sample_cluster());
        DeletionTransformer.transform(&mut ctx).await.unwrap();
        assert!(ctx.graph.is_empty());
        assert!(ctx.cluster.status.is_none());
    }

    #[tokio::test]
    async fn test_do_not_terminate_blocks() {
        let fixtures = Fixtures {
            components: vec![running_component("comp1", "mysql", ComponentPhase::Running)],
            ..Default::default()
        };
        let (mut ctx, events) =
            fixtures.context_with(deleting(TerminationPolicy::DoNotTerminate), Default::default());

        let err = DeletionTransformer.transform(&mut ctx).await.unwrap_err();
        assert!(err.is_premature_stop());
        assert!(ctx.graph.is_empty());
        assert!(events.has_reason(reasons::DELETION_BLOCKED));
        let status = ctx.cluster.status.as_ref().unwrap();
        assert_eq!(status.phase, Some(ClusterPhase::Deleting));
        assert!(status
            .message
            .as_deref()
            .unwrap()
            .contains("spec.terminationPolicy DoNotTerminate is preventing deleting cluster"));
    }

    #[tokio::test]
    async fn test_components_follow_terminate_order() {
        let fixtures = Fixtures {
            components: vec![
                running_component("comp1", "mysql", ComponentPhase::Running),
                running_component("comp2", "mysql", ComponentPhase::Running),
                running_component("comp3", "mysql", ComponentPhase::Running),
            ],
            ..Default::default()
        };
        let mut ctx = context(&fixtures, TerminationPolicy::WipeOut);

        let err = DeletionTransformer.transform(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("retry later: comp2 are not ready"));
        assert_eq!(ctx.graph.component_names(Verb::Delete), vec!["mycluster-comp1"]);
        // no scale-in marker on teardown
        assert!(ctx.graph.component_names(Verb::Update).is_empty());
    }

    #[tokio::test]
    async fn test_next_component_once_predecessor_is_gone() {
        let fixtures = Fixtures {
            components: vec![
                running_component("comp2", "mysql", ComponentPhase::Running),
                running_component("comp3", "mysql", ComponentPhase::Running),
            ],
            ..Default::default()
        };
        let mut ctx = context(&fixtures, TerminationPolicy::Delete);

        let err = DeletionTransformer.transform(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("comp3"));
        assert_eq!(ctx.graph.component_names(Verb::Delete), vec!["mycluster-comp2"]);
    }

    #[tokio::test]
    async fn test_owned_objects_by_policy() {
        let owned = BTreeMap::from([
            (OwnedKind::Service, vec!["mycluster-mysql".to_string()]),
            (OwnedKind::Backup, vec!["nightly".to_string()]),
        ]);
        let fixtures = Fixtures {
            owned,
            ..Default::default()
        };

        let mut ctx = context(&fixtures, TerminationPolicy::Delete);
        let err = DeletionTransformer.transform(&mut ctx).await.unwrap_err();
        assert_eq!(err.requeue_after(), Some(DELETION_REQUEUE));
        let names: Vec<String> = ctx.graph.vertices().iter().map(|v| v.object.name()).collect();
        assert_eq!(names, vec!["mycluster-mysql"]);

        let mut ctx = context(&fixtures, TerminationPolicy::WipeOut);
        DeletionTransformer.transform(&mut ctx).await.unwrap_err();
        let names: Vec<String> = ctx.graph.vertices().iter().map(|v| v.object.name()).collect();
        assert_eq!(names, vec!["mycluster-mysql", "nightly"]);
    }

    #[tokio::test]
    async fn test_finalizer_released_when_nothing_is_left() {
        let fixtures = Fixtures::default();
        let mut ctx = context(&fixtures, TerminationPolicy::Delete);

        let chain: Vec<Box<dyn Transformer>> =
            vec![Box::new(DeletionTransformer), Box::new(MetaTransformer)];
        run_pipeline(&chain, &mut ctx).await.unwrap();

        let vertices = ctx.graph.vertices();
        assert_eq!(vertices.len(), 1);
        assert_eq!(vertices[0].verb, Verb::Update);
        let ClusterObject::Cluster(cluster) = &vertices[0].object else {
            panic!("expected the cluster");
        };
        assert!(!cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER));
    }
}
