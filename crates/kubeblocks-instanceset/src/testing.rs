//! Fixtures shared by the instance-set crate's tests

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Pod, PodCondition, PodSpec, PodStatus, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use kubeblocks_common::constants::{INSTANCE_SET_FINALIZER, REVISION_LABEL, ROLE_LABEL};
use kubeblocks_common::crd::{
    AccessMode, InstanceSet, InstanceSetSpec, InstanceSetStatus, InstanceTemplate, ReplicaRole,
};
use kubeblocks_common::OperatorConfig;

use crate::instance::{build_pod, InstanceSetExt};
use crate::tree::{ObjectTree, TreeObject};

pub const NAMESPACE: &str = "default";

/// An InstanceSet named `its` at generation 1 whose status has caught up
pub fn sample_its(replicas: i32) -> InstanceSet {
    let mut its = InstanceSet::new(
        "its",
        InstanceSetSpec {
            replicas,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([("app".to_string(), "db".to_string())])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "main".to_string(),
                        image: Some("mysql:8.0".to_string()),
                        ports: Some(vec![ContainerPort {
                            name: Some("mysql".to_string()),
                            container_port: 3306,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        },
    );
    its.metadata.namespace = Some(NAMESPACE.to_string());
    its.metadata.uid = Some("its-uid".to_string());
    its.metadata.generation = Some(1);
    its.metadata.finalizers = Some(vec![INSTANCE_SET_FINALIZER.to_string()]);
    its.status = Some(InstanceSetStatus {
        observed_generation: 1,
        ..Default::default()
    });
    its
}

/// `sample_its` with named templates of the given replica counts
pub fn its_with_templates(replicas: i32, templates: &[(&str, i32)]) -> InstanceSet {
    let mut its = sample_its(replicas);
    its.spec.instances = templates
        .iter()
        .map(|(name, replicas)| InstanceTemplate {
            name: name.to_string(),
            replicas: Some(*replicas),
            ..Default::default()
        })
        .collect();
    its
}

/// Leader, read-only follower and learner roles
pub fn roles() -> Vec<ReplicaRole> {
    vec![
        ReplicaRole {
            name: "leader".to_string(),
            access_mode: AccessMode::ReadWrite,
            can_vote: true,
            is_leader: true,
        },
        ReplicaRole {
            name: "follower".to_string(),
            access_mode: AccessMode::Readonly,
            can_vote: true,
            is_leader: false,
        },
        ReplicaRole {
            name: "learner".to_string(),
            access_mode: AccessMode::Readonly,
            can_vote: false,
            is_leader: false,
        },
    ]
}

/// A bare pod just created with `revision`
pub fn pod(name: &str, revision: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([(
                REVISION_LABEL.to_string(),
                revision.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        status: None,
    }
}

/// Mark a pod running and ready since a minute ago
pub fn make_ready(pod: &mut Pod) {
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            last_transition_time: Some(Time(Utc::now() - Duration::minutes(1))),
            ..Default::default()
        }]),
        ..Default::default()
    });
}

/// A running, ready pod with `revision`
pub fn ready_pod(name: &str, revision: &str) -> Pod {
    let mut p = pod(name, revision);
    make_ready(&mut p);
    p
}

/// Set a pod's role label
pub fn with_role(mut pod: Pod, role: &str) -> Pod {
    pod.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(ROLE_LABEL.to_string(), role.to_string());
    pod
}

/// The pod the set would build for `name`
pub fn built_pod(its: &InstanceSet, name: &str) -> Pod {
    let config = OperatorConfig::default();
    let ext = InstanceSetExt::build(its, &config).unwrap();
    build_pod(its, name, ext.template_of(name).unwrap(), &config)
}

/// A ready pod exactly as the set would build it for `name`
pub fn ready_built_pod(its: &InstanceSet, name: &str) -> Pod {
    let mut p = built_pod(its, name);
    make_ready(&mut p);
    p
}

/// A tree of `its` holding `pods`
pub fn tree_with_pods(its: InstanceSet, pods: Vec<Pod>) -> ObjectTree {
    ObjectTree::new(its, Utc::now()).with_objects(pods.into_iter().map(TreeObject::from))
}

/// Names of the tree's pods
pub fn pod_names(tree: &ObjectTree) -> Vec<String> {
    tree.pods()
        .iter()
        .filter_map(|p| p.metadata.name.clone())
        .collect()
}
