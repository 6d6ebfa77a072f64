//! Fixtures shared by the cluster crate's tests

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use kubeblocks_common::constants::{
    component_full_name, KUBEBLOCKS_GENERATION_KEY, SHARDING_NAME_LABEL, SHARD_TEMPLATE_LABEL,
};
use kubeblocks_common::crd::{
    Cluster, ClusterComponentSpec, ClusterDefinition, ClusterDefinitionSpec,
    ClusterDefinitionStatus, ClusterSpec, ClusterTopology, CompatibilityRule, Component,
    ComponentDefinition, ComponentDefinitionSpec, ComponentPhase, ComponentSpec, ComponentStatus,
    ComponentVersion, ComponentVersionRelease, ComponentVersionSpec, DefinitionPhase,
    DefinitionStatus, ShardingDefinition, ShardingDefinitionSpec, ShardingTemplate,
    SidecarDefinition,
};
use kubeblocks_common::events::RecordingEventPublisher;
use kubeblocks_common::OperatorConfig;

use crate::builder::cluster_labels;
use crate::context::TransformContext;
use crate::lifecycle::MockLifecycleActions;
use crate::store::{MockClusterStore, OwnedKind};

/// Seed used wherever shard ids must be predictable
pub const SEED: u64 = 1_670_750_000;

pub const CLUSTER: &str = "mycluster";
pub const NAMESPACE: &str = "default";

fn available() -> DefinitionStatus {
    DefinitionStatus {
        observed_generation: Some(1),
        phase: DefinitionPhase::Available,
        message: None,
    }
}

pub fn sample_cluster() -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(CLUSTER.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some("cluster-uid".to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: ClusterSpec::default(),
        status: None,
    }
}

pub fn comp_spec(name: &str, comp_def: &str) -> ClusterComponentSpec {
    ClusterComponentSpec {
        name: name.to_string(),
        component_def: comp_def.to_string(),
        replicas: 1,
        ..Default::default()
    }
}

pub fn comp_def(name: &str, service_version: &str) -> ComponentDefinition {
    let mut def = ComponentDefinition::new(
        name,
        ComponentDefinitionSpec {
            service_version: service_version.to_string(),
            ..Default::default()
        },
    );
    def.metadata.generation = Some(1);
    def.status = Some(available());
    def
}

pub fn comp_version(
    name: &str,
    comp_defs: &[&str],
    releases: &[(&str, &str)],
) -> ComponentVersion {
    let mut version = ComponentVersion::new(
        name,
        ComponentVersionSpec {
            compatibility_rules: vec![CompatibilityRule {
                comp_defs: comp_defs.iter().map(|s| s.to_string()).collect(),
                releases: releases.iter().map(|(r, _)| r.to_string()).collect(),
            }],
            releases: releases
                .iter()
                .map(|(r, v)| ComponentVersionRelease {
                    name: r.to_string(),
                    service_version: v.to_string(),
                    images: BTreeMap::new(),
                })
                .collect(),
        },
    );
    version.metadata.generation = Some(1);
    version.status = Some(available());
    version
}

pub fn sharding_def(name: &str, comp_def: &str) -> ShardingDefinition {
    let mut def = ShardingDefinition::new(
        name,
        ShardingDefinitionSpec {
            template: ShardingTemplate {
                comp_def: comp_def.to_string(),
            },
            ..Default::default()
        },
    );
    def.metadata.generation = Some(1);
    def.status = Some(available());
    def
}

pub fn cluster_def(name: &str, topologies: Vec<ClusterTopology>) -> ClusterDefinition {
    let mut def = ClusterDefinition::new(name, ClusterDefinitionSpec { topologies });
    def.metadata.generation = Some(1);
    def.status = Some(ClusterDefinitionStatus {
        observed_generation: Some(1),
        phase: DefinitionPhase::Available,
        message: None,
    });
    def
}

/// A component that is up to date with cluster generation 1 and in `phase`
pub fn running_component(short_name: &str, comp_def: &str, phase: ComponentPhase) -> Component {
    let mut comp = Component::new(
        &component_full_name(CLUSTER, short_name),
        ComponentSpec {
            comp_def: comp_def.to_string(),
            replicas: 1,
            ..Default::default()
        },
    );
    comp.metadata.namespace = Some(NAMESPACE.to_string());
    comp.metadata.generation = Some(1);
    comp.metadata.labels = Some(cluster_labels(CLUSTER));
    comp.metadata.annotations = Some(BTreeMap::from([(
        KUBEBLOCKS_GENERATION_KEY.to_string(),
        "1".to_string(),
    )]));
    comp.status = Some(ComponentStatus {
        observed_generation: Some(1),
        phase: Some(phase),
        ..Default::default()
    });
    comp
}

/// A running shard of `sharding`
pub fn running_shard(sharding: &str, id: &str, comp_def: &str, template: Option<&str>) -> Component {
    let mut comp = running_component(
        &format!("{}-{}", sharding, id),
        comp_def,
        ComponentPhase::Running,
    );
    let labels = comp.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(SHARDING_NAME_LABEL.to_string(), sharding.to_string());
    if let Some(template) = template {
        labels.insert(SHARD_TEMPLATE_LABEL.to_string(), template.to_string());
    }
    comp
}

/// In-memory state served by a mocked store
#[derive(Clone, Default)]
pub struct Fixtures {
    pub cluster_defs: Vec<ClusterDefinition>,
    pub comp_defs: Vec<ComponentDefinition>,
    pub comp_versions: Vec<ComponentVersion>,
    pub sharding_defs: Vec<ShardingDefinition>,
    pub sidecar_defs: Vec<SidecarDefinition>,
    pub components: Vec<Component>,
    pub secrets: Vec<Secret>,
    pub owned: BTreeMap<OwnedKind, Vec<String>>,
}

impl Fixtures {
    /// A store answering every read from the fixtures; writes are not expected
    pub fn store(&self) -> MockClusterStore {
        let mut store = MockClusterStore::new();

        let defs = self.cluster_defs.clone();
        store
            .expect_get_cluster_definition()
            .returning(move |name| Ok(defs.iter().find(|d| d.name_any() == name).cloned()));

        let comp_defs = self.comp_defs.clone();
        store
            .expect_list_component_definitions()
            .returning(move || Ok(comp_defs.clone()));

        let versions = self.comp_versions.clone();
        store
            .expect_list_component_versions()
            .returning(move || Ok(versions.clone()));

        let sharding_defs = self.sharding_defs.clone();
        store
            .expect_list_sharding_definitions()
            .returning(move || Ok(sharding_defs.clone()));

        let sharding_defs = self.sharding_defs.clone();
        store.expect_get_sharding_definition().returning(move |name| {
            Ok(sharding_defs.iter().find(|d| d.name_any() == name).cloned())
        });

        let sidecar_defs = self.sidecar_defs.clone();
        store
            .expect_list_sidecar_definitions()
            .returning(move || Ok(sidecar_defs.clone()));

        let components = self.components.clone();
        store.expect_get_component().returning(move |ns, name| {
            Ok(components
                .iter()
                .find(|c| c.namespace().as_deref() == Some(ns) && c.name_any() == name)
                .cloned())
        });

        let components = self.components.clone();
        store.expect_list_components().returning(move |ns, labels| {
            Ok(components
                .iter()
                .filter(|c| c.namespace().as_deref() == Some(ns))
                .filter(|c| labels.iter().all(|(k, v)| c.label(k) == Some(v.as_str())))
                .cloned()
                .collect())
        });

        let secrets = self.secrets.clone();
        store.expect_get_secret().returning(move |ns, name| {
            Ok(secrets
                .iter()
                .find(|s| s.namespace().as_deref() == Some(ns) && s.name_any() == name)
                .cloned())
        });

        let owned = self.owned.clone();
        store
            .expect_list_owned()
            .returning(move |_, kind, _| Ok(owned.get(&kind).cloned().unwrap_or_default()));

        store
    }

    /// A pass over `cluster` with no lifecycle actions expected
    pub fn context(&self, cluster: Cluster) -> TransformContext {
        self.context_with(cluster, MockLifecycleActions::new()).0
    }

    /// A pass over `cluster` using the given action runner, with recorded events
    pub fn context_with(
        &self,
        cluster: Cluster,
        lifecycle: MockLifecycleActions,
    ) -> (TransformContext, Arc<RecordingEventPublisher>) {
        let events = Arc::new(RecordingEventPublisher::default());
        let ctx = TransformContext::new(
            cluster,
            Arc::new(OperatorConfig::default()),
            Arc::new(self.store()),
            Arc::new(lifecycle),
            events.clone(),
        )
        .with_rng(StdRng::seed_from_u64(SEED));
        (ctx, events)
    }
}
