//! Component object construction and merging

use std::collections::BTreeMap;

use kube::{Resource, ResourceExt};

use kubeblocks_common::constants::{
    component_full_name, APP_INSTANCE_LABEL, APP_MANAGED_BY_LABEL, APP_MANAGED_BY_VALUE,
    CRD_API_VERSION_ANNOTATION, KUBEBLOCKS_GENERATION_KEY, MULTI_CLUSTER_PLACEMENT_ANNOTATION,
    RESTORE_FROM_BACKUP_ANNOTATION,
};
use kubeblocks_common::crd::{Cluster, ClusterComponentSpec, Component, ComponentSpec};
use kubeblocks_common::quantity::{normalize_requirements, normalize_resource_list};
use kubeblocks_common::{Error, Result};

/// Labels every object of the cluster carries
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_INSTANCE_LABEL.to_string(), cluster.to_string()),
        (APP_MANAGED_BY_LABEL.to_string(), APP_MANAGED_BY_VALUE.to_string()),
    ])
}

/// The restore source for `key` from the cluster's restore annotation
///
/// The annotation holds a JSON object keyed by component or sharding name;
/// the component receives only its own entry.
fn restore_annotation(cluster: &Cluster, key: &str) -> Result<Option<String>> {
    let Some(raw) = cluster.annotation(RESTORE_FROM_BACKUP_ANNOTATION) else {
        return Ok(None);
    };
    let sources: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw).map_err(|e| {
        Error::serialization_for_kind(
            "Cluster",
            format!("invalid {} annotation: {}", RESTORE_FROM_BACKUP_ANNOTATION, e),
        )
    })?;
    match sources.get(key) {
        Some(source) => {
            let mut own = serde_json::Map::new();
            own.insert(key.to_string(), source.clone());
            Ok(Some(serde_json::Value::Object(own).to_string()))
        }
        None => Ok(None),
    }
}

/// Build the desired Component for one component spec of the cluster
///
/// `restore_key` selects the restore source: the component name for plain
/// components, the sharding name for shards.
pub fn build_component(
    cluster: &Cluster,
    spec: &ClusterComponentSpec,
    extra_labels: BTreeMap<String, String>,
    extra_annotations: BTreeMap<String, String>,
    restore_key: &str,
) -> Result<Component> {
    let cluster_name = cluster.name_any();

    let mut labels = cluster_labels(&cluster_name);
    labels.extend(extra_labels);

    let mut annotations = BTreeMap::from([(
        KUBEBLOCKS_GENERATION_KEY.to_string(),
        cluster.generation().to_string(),
    )]);
    if let Some(version) = cluster
        .annotation(CRD_API_VERSION_ANNOTATION)
        .filter(|v| !v.is_empty())
    {
        annotations.insert(CRD_API_VERSION_ANNOTATION.to_string(), version.to_string());
    }
    if let Some(placement) = cluster.annotation(MULTI_CLUSTER_PLACEMENT_ANNOTATION) {
        annotations.insert(
            MULTI_CLUSTER_PLACEMENT_ANNOTATION.to_string(),
            placement.to_string(),
        );
    }
    if let Some(restore) = restore_annotation(cluster, restore_key)? {
        annotations.insert(RESTORE_FROM_BACKUP_ANNOTATION.to_string(), restore);
    }
    annotations.extend(extra_annotations);

    let mut component = Component::new(
        &component_full_name(&cluster_name, &spec.name),
        ComponentSpec {
            comp_def: spec.component_def.clone(),
            service_version: spec.service_version.clone(),
            labels: spec.labels.clone(),
            annotations: spec.annotations.clone(),
            env: spec.env.clone(),
            replicas: spec.replicas,
            scheduling_policy: spec
                .scheduling_policy
                .clone()
                .or_else(|| cluster.spec.scheduling_policy.clone()),
            resources: spec.resources.clone(),
            volume_claim_templates: spec.volume_claim_templates.clone(),
            volumes: spec.volumes.clone(),
            services: spec.services.clone(),
            tls: spec.tls,
            service_account_name: spec.service_account_name.clone(),
            pod_update_policy: spec.pod_update_policy,
            instances: spec.instances.clone(),
            offline_instances: spec.offline_instances.clone(),
            disable_exporter: spec.disable_exporter,
            stop: spec.stop,
            runtime_class_name: cluster.spec.runtime_class_name.clone(),
            sidecars: Vec::new(),
        },
    );
    component.metadata.namespace = cluster.metadata.namespace.clone();
    component.metadata.labels = Some(labels);
    component.metadata.annotations = Some(annotations);
    component.metadata.owner_references = cluster.controller_owner_ref(&()).map(|o| vec![o]);
    Ok(component)
}

fn normalized(spec: &ComponentSpec) -> Result<ComponentSpec> {
    let mut spec = spec.clone();
    normalize_requirements(&mut spec.resources)?;
    for vct in spec.volume_claim_templates.iter_mut() {
        if let Some(resources) = vct.spec.resources.as_mut() {
            if let Some(limits) = resources.limits.as_mut() {
                *limits = normalize_resource_list(limits)?;
            }
            if let Some(requests) = resources.requests.as_mut() {
                *requests = normalize_resource_list(requests)?;
            }
        }
    }
    Ok(spec)
}

/// Merge a desired Component onto the running one
///
/// Labels and annotations are merged (nothing is removed); every spec field
/// is taken from `proto`. Returns `None` when the merged object equals the
/// running one once resource quantities are normalized.
pub fn copy_and_merge(running: &Component, proto: &Component) -> Result<Option<Component>> {
    let mut merged = running.clone();

    if let Some(annotations) = &proto.metadata.annotations {
        merged
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
    }
    if let Some(labels) = &proto.metadata.labels {
        merged
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
    }
    merged.spec = proto.spec.clone();

    let metadata_changed = running.metadata.annotations != merged.metadata.annotations
        || running.metadata.labels != merged.metadata.labels;
    let spec_changed = normalized(&running.spec)? != normalized(&merged.spec)?;

    if !metadata_changed && !spec_changed {
        return Ok(None);
    }
    Ok(Some(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubeblocks_common::crd::ClusterSpec;

    fn cluster() -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some("mycluster".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                generation: Some(4),
                annotations: Some(BTreeMap::from([(
                    RESTORE_FROM_BACKUP_ANNOTATION.to_string(),
                    r#"{"mysql":{"name":"backup-1"},"proxy":{"name":"backup-2"}}"#.to_string(),
                )])),
                ..Default::default()
            },
            spec: ClusterSpec {
                runtime_class_name: Some("kata".to_string()),
                ..Default::default()
            },
            status: None,
        }
    }

    fn spec(cpu: &str) -> ClusterComponentSpec {
        ClusterComponentSpec {
            name: "mysql".to_string(),
            component_def: "mysql-8.0".to_string(),
            replicas: 3,
            resources: ResourceRequirements {
                limits: Some(BTreeMap::from([("cpu".to_string(), Quantity(cpu.to_string()))])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_build_component_identity_and_annotations() {
        let comp = build_component(&cluster(), &spec("1"), BTreeMap::new(), BTreeMap::new(), "mysql")
            .unwrap();

        assert_eq!(comp.name_any(), "mycluster-mysql");
        assert_eq!(comp.namespace().as_deref(), Some("default"));
        assert_eq!(comp.label(APP_INSTANCE_LABEL), Some("mycluster"));
        assert_eq!(comp.annotation(KUBEBLOCKS_GENERATION_KEY), Some("4"));
        assert_eq!(
            comp.annotation(RESTORE_FROM_BACKUP_ANNOTATION),
            Some(r#"{"mysql":{"name":"backup-1"}}"#)
        );
        assert_eq!(comp.spec.runtime_class_name.as_deref(), Some("kata"));
        assert_eq!(comp.spec.replicas, 3);
        let owners = comp.metadata.owner_references.unwrap();
        assert_eq!(owners[0].name, "mycluster");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_restore_annotation_absent_for_other_components() {
        let mut s = spec("1");
        s.name = "redis".to_string();
        let comp = build_component(&cluster(), &s, BTreeMap::new(), BTreeMap::new(), "redis").unwrap();
        assert!(comp.annotation(RESTORE_FROM_BACKUP_ANNOTATION).is_none());
    }

    #[test]
    fn test_invalid_restore_annotation_is_an_error() {
        let mut c = cluster();
        c.metadata.annotations = Some(BTreeMap::from([(
            RESTORE_FROM_BACKUP_ANNOTATION.to_string(),
            "not json".to_string(),
        )]));
        assert!(build_component(&c, &spec("1"), BTreeMap::new(), BTreeMap::new(), "mysql").is_err());
    }

    #[test]
    fn test_merge_ignores_equivalent_quantities() {
        let c = cluster();
        let running =
            build_component(&c, &spec("1000m"), BTreeMap::new(), BTreeMap::new(), "mysql").unwrap();
        let proto = build_component(&c, &spec("1"), BTreeMap::new(), BTreeMap::new(), "mysql").unwrap();
        assert!(copy_and_merge(&running, &proto).unwrap().is_none());
    }

    #[test]
    fn test_merge_detects_spec_change_and_keeps_running_metadata() {
        let c = cluster();
        let mut running =
            build_component(&c, &spec("1"), BTreeMap::new(), BTreeMap::new(), "mysql").unwrap();
        running
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("extra".to_string(), "kept".to_string());
        running.metadata.resource_version = Some("42".to_string());

        let proto = build_component(&c, &spec("2"), BTreeMap::new(), BTreeMap::new(), "mysql").unwrap();
        let merged = copy_and_merge(&running, &proto).unwrap().unwrap();

        assert_eq!(merged.label("extra"), Some("kept"));
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(
            merged.spec.resources.limits.unwrap()["cpu"],
            Quantity("2".to_string())
        );
    }

    #[test]
    fn test_merge_detects_new_annotation() {
        let c = cluster();
        let running =
            build_component(&c, &spec("1"), BTreeMap::new(), BTreeMap::new(), "mysql").unwrap();
        let proto = build_component(
            &c,
            &spec("1"),
            BTreeMap::new(),
            BTreeMap::from([("note".to_string(), "x".to_string())]),
            "mysql",
        )
        .unwrap();
        assert!(copy_and_merge(&running, &proto).unwrap().is_some());
    }
}
