//! Services and the env config map of an InstanceSet

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use kubeblocks_common::constants::ROLE_LABEL;
use kubeblocks_common::crd::InstanceSet;
use kubeblocks_common::{OperatorConfig, Result};

use super::live_root;
use crate::instance::{
    copy_and_merge_config_map, copy_and_merge_service, env_config_map_name,
    generate_all_instance_names, headless_service_name, match_labels, owner_reference,
};
use crate::reconciler::{CheckResult, ReconcileResult, Reconciler};
use crate::tree::{ObjectKind, ObjectTree, TreeObject};

/// Keeps the headless service, the optional client service and the env
/// config map in line with the spec
pub struct AssistantObjectReconciler;

fn object_meta(its: &InstanceSet, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: its.namespace(),
        labels: Some(match_labels(its)),
        owner_references: Some(vec![owner_reference(its)]),
        ..Default::default()
    }
}

/// Ports of every container in the base template
///
/// Unnamed ports are named `<protocol>-<port>`.
fn container_ports(its: &InstanceSet) -> Vec<ServicePort> {
    let Some(spec) = its.spec.template.spec.as_ref() else {
        return Vec::new();
    };
    spec.containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .map(|port| {
            let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
            let name = port
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", protocol.to_lowercase(), port.container_port));
            ServicePort {
                name: Some(name),
                port: port.container_port,
                target_port: Some(IntOrString::Int(port.container_port)),
                protocol: Some(protocol),
                ..Default::default()
            }
        })
        .collect()
}

fn build_headless_service(its: &InstanceSet) -> Service {
    Service {
        metadata: object_meta(its, headless_service_name(its)),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            selector: Some(match_labels(its)),
            publish_not_ready_addresses: Some(true),
            ports: Some(container_ports(its)),
            ..Default::default()
        }),
        status: None,
    }
}

/// The client service, routed to the leader when the set has one
fn build_client_service(its: &InstanceSet) -> Option<Service> {
    let template = its.spec.service.as_ref()?;
    let name = template
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| its.name_any());

    let mut metadata = object_meta(its, name);
    if let Some(labels) = &template.metadata.labels {
        metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels.clone());
    }
    metadata.annotations = template.metadata.annotations.clone();

    let mut selector = match_labels(its);
    if let Some(leader) = its.spec.roles.iter().find(|r| r.is_leader) {
        selector.insert(ROLE_LABEL.to_string(), leader.name.to_lowercase());
    }
    let mut spec = template.spec.clone().unwrap_or_default();
    spec.selector = Some(selector);
    if spec.ports.as_ref().map_or(true, Vec::is_empty) {
        spec.ports = Some(container_ports(its));
    }
    Some(Service {
        metadata,
        spec: Some(spec),
        status: None,
    })
}

/// Env shared by every pod: instance count, pod list, owner and roles
fn build_env_config_map(its: &InstanceSet) -> Result<ConfigMap> {
    let names = generate_all_instance_names(its)?;
    let mut data = BTreeMap::from([
        ("KB_ITS_N".to_string(), its.spec.replicas.to_string()),
        ("KB_ITS_POD_LIST".to_string(), names.join(",")),
        ("KB_ITS_OWNER_UID".to_string(), its.uid().unwrap_or_default()),
    ]);
    if let Some(status) = &its.status {
        let mut leader = None;
        let mut followers = Vec::new();
        for member in &status.members_status {
            match &member.replica_role {
                Some(role) if role.is_leader => leader = Some(member.pod_name.clone()),
                Some(_) => followers.push(member.pod_name.clone()),
                None => {}
            }
        }
        if let Some(leader) = leader {
            data.insert("KB_ITS_LEADER".to_string(), leader);
        }
        if !followers.is_empty() {
            data.insert("KB_ITS_FOLLOWERS".to_string(), followers.join(","));
        }
    }
    Ok(ConfigMap {
        metadata: object_meta(its, env_config_map_name(&its.name_any())),
        data: Some(data),
        ..Default::default()
    })
}

impl Reconciler for AssistantObjectReconciler {
    fn name(&self) -> &'static str {
        "assistant-object"
    }

    fn pre_condition(&self, tree: &mut ObjectTree, _config: &OperatorConfig) -> CheckResult {
        if live_root(tree).is_some() {
            CheckResult::Satisfied
        } else {
            CheckResult::Unsatisfied
        }
    }

    fn reconcile(&self, tree: &mut ObjectTree, _config: &OperatorConfig) -> Result<ReconcileResult> {
        let Some(its) = tree.root().cloned() else {
            return Ok(ReconcileResult::Continue);
        };

        let mut desired: Vec<TreeObject> = vec![build_headless_service(&its).into()];
        if let Some(service) = build_client_service(&its) {
            desired.push(service.into());
        }
        desired.push(build_env_config_map(&its)?.into());

        let wanted: BTreeSet<(ObjectKind, String)> =
            desired.iter().map(|o| (o.kind(), o.name())).collect();

        for object in desired {
            let merged = match (tree.get(object.kind(), &object.name()), &object) {
                (None, _) => {
                    tree.add(object)?;
                    continue;
                }
                (Some(TreeObject::Service(old)), TreeObject::Service(new)) => {
                    TreeObject::from(copy_and_merge_service(old, new))
                }
                (Some(TreeObject::ConfigMap(old)), TreeObject::ConfigMap(new)) => {
                    TreeObject::from(copy_and_merge_config_map(old, new))
                }
                _ => continue,
            };
            if tree.get(merged.kind(), &merged.name()) != Some(&merged) {
                tree.update(merged)?;
            }
        }

        let stale: Vec<(ObjectKind, String)> = [ObjectKind::Service, ObjectKind::ConfigMap]
            .into_iter()
            .flat_map(|kind| tree.list(kind))
            .map(|o| (o.kind(), o.name()))
            .filter(|key| !wanted.contains(key))
            .collect();
        for (kind, name) in stale {
            tree.delete(kind, &name);
        }
        Ok(ReconcileResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{roles, sample_its};
    use crate::tree::Mutation;
    use chrono::Utc;
    use kubeblocks_common::crd::{InstanceSetStatus, MemberStatus};

    fn reconcile(tree: &mut ObjectTree) {
        AssistantObjectReconciler
            .reconcile(tree, &OperatorConfig::default())
            .unwrap();
    }

    fn plan(tree: &ObjectTree) -> Vec<String> {
        tree.plan().iter().map(Mutation::describe).collect()
    }

    #[test]
    fn test_creates_headless_service_and_env() {
        let mut tree = ObjectTree::new(sample_its(2), Utc::now());
        reconcile(&mut tree);

        assert_eq!(
            plan(&tree),
            vec!["create ConfigMap its-env", "create Service its-headless"]
        );
        let Some(TreeObject::Service(svc)) = tree.get(ObjectKind::Service, "its-headless") else {
            panic!("headless service missing");
        };
        let spec = svc.spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(spec.ports.as_ref().unwrap()[0].name.as_deref(), Some("mysql"));

        let Some(TreeObject::ConfigMap(cm)) = tree.get(ObjectKind::ConfigMap, "its-env") else {
            panic!("env config map missing");
        };
        let data = cm.data.as_ref().unwrap();
        assert_eq!(data["KB_ITS_N"], "2");
        assert_eq!(data["KB_ITS_POD_LIST"], "its-0,its-1");
    }

    #[test]
    fn test_second_pass_is_a_noop() {
        let mut first = ObjectTree::new(sample_its(2), Utc::now());
        reconcile(&mut first);
        let objects: Vec<TreeObject> = [ObjectKind::Service, ObjectKind::ConfigMap]
            .into_iter()
            .flat_map(|k| first.list(k).into_iter().cloned())
            .collect();

        let mut second = ObjectTree::new(sample_its(2), Utc::now()).with_objects(objects);
        reconcile(&mut second);
        assert!(plan(&second).is_empty());
    }

    #[test]
    fn test_client_service_selects_leader_and_stale_service_is_removed() {
        let mut its = sample_its(3);
        its.spec.roles = roles();
        its.spec.service = Some(Service::default());
        let stale = Service {
            metadata: ObjectMeta {
                name: Some("its-old".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut tree = ObjectTree::new(its, Utc::now()).with_objects([TreeObject::from(stale)]);
        reconcile(&mut tree);

        let Some(TreeObject::Service(svc)) = tree.get(ObjectKind::Service, "its") else {
            panic!("client service missing");
        };
        let selector = svc.spec.as_ref().unwrap().selector.as_ref().unwrap();
        assert_eq!(selector[ROLE_LABEL], "leader");
        assert!(plan(&tree).contains(&"delete Service its-old".to_string()));
    }

    #[test]
    fn test_env_lists_leader_and_followers() {
        let mut its = sample_its(3);
        let all = roles();
        its.status = Some(InstanceSetStatus {
            observed_generation: 1,
            members_status: vec![
                MemberStatus {
                    pod_name: "its-0".to_string(),
                    replica_role: Some(all[0].clone()),
                },
                MemberStatus {
                    pod_name: "its-1".to_string(),
                    replica_role: Some(all[1].clone()),
                },
                MemberStatus {
                    pod_name: "its-2".to_string(),
                    replica_role: Some(all[1].clone()),
                },
            ],
            ..Default::default()
        });
        let cm = build_env_config_map(&its).unwrap();
        let data = cm.data.unwrap();
        assert_eq!(data["KB_ITS_LEADER"], "its-0");
        assert_eq!(data["KB_ITS_FOLLOWERS"], "its-1,its-2");
    }

    #[test]
    fn test_changed_ports_update_service_keeping_cluster_ip() {
        let its = sample_its(1);
        let mut live = build_headless_service(&its);
        live.spec.as_mut().unwrap().ports = Some(Vec::new());
        live.metadata.resource_version = Some("7".to_string());
        let mut tree = ObjectTree::new(its, Utc::now()).with_objects([TreeObject::from(live)]);
        reconcile(&mut tree);

        assert!(plan(&tree).contains(&"update Service its-headless".to_string()));
        let Some(TreeObject::Service(svc)) = tree.get(ObjectKind::Service, "its-headless") else {
            panic!("headless service missing");
        };
        assert_eq!(svc.metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(svc.spec.as_ref().unwrap().ports.as_ref().unwrap().len(), 1);
    }
}
