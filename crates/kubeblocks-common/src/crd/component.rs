//! Component CRD types
//!
//! A Component is one fully resolved workload unit of a cluster, named
//! `<cluster>-<component>`. Shards of a sharding are Components too.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, Volume};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cluster::{
    ComponentInstanceTemplate, ComponentPhase, ComponentService, PodUpdatePolicy,
    SchedulingPolicy, VolumeClaimTemplate,
};
use super::types::Condition;
use crate::constants::{KUBEBLOCKS_GENERATION_KEY, SHARDING_NAME_LABEL};

/// A sidecar attached to a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sidecar {
    /// Sidecar name
    pub name: String,
    /// ComponentDefinition owning the sidecar's containers
    pub owner: String,
    /// SidecarDefinition providing it
    pub sidecar_def: String,
}

/// Resolved desired state of a component
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apps.kubeblocks.io",
    version = "v1",
    kind = "Component",
    plural = "components",
    shortname = "cmp",
    namespaced,
    derive = "PartialEq",
    status = "ComponentStatus",
    printcolumn = r#"{"name":"Definition","type":"string","jsonPath":".spec.compDef"}"#,
    printcolumn = r#"{"name":"Service-Version","type":"string","jsonPath":".spec.serviceVersion"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Resolved ComponentDefinition name
    pub comp_def: String,

    /// Resolved service version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_version: String,

    /// Extra labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Desired replicas
    #[serde(default)]
    pub replicas: i32,

    /// Scheduling constraints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,

    /// Compute resources
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Persistent volume claim templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,

    /// Extra pod volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ComponentService>,

    /// Enable TLS
    #[serde(default)]
    pub tls: bool,

    /// Service account for pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// In-place update policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_update_policy: Option<PodUpdatePolicy>,

    /// Per-instance overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<ComponentInstanceTemplate>,

    /// Instances that must not run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline_instances: Vec<String>,

    /// Do not run the metrics exporter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_exporter: Option<bool>,

    /// Stop the component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<bool>,

    /// Runtime class for pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,

    /// Attached sidecars, sorted by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<Sidecar>,
}

/// Observed state of a Component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Generation last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ComponentPhase>,
    /// Details keyed by object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message: BTreeMap<String, String>,
    /// Conditions, including `Available`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Component {
    /// Label value, if present
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    /// Annotation value, if present
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Sharding this component is a shard of
    pub fn sharding_name(&self) -> Option<&str> {
        self.label(SHARDING_NAME_LABEL).filter(|s| !s.is_empty())
    }

    /// Reported phase
    pub fn phase(&self) -> Option<ComponentPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// True if `generation == status.observedGeneration`
    pub fn is_generation_observed(&self) -> bool {
        let observed = self.status.as_ref().and_then(|s| s.observed_generation);
        observed.is_some() && observed == self.metadata.generation
    }

    /// True if the component reflects `cluster_generation` and is reconciled
    pub fn is_up_to_date(&self, cluster_generation: i64) -> bool {
        let recorded = self
            .annotation(KUBEBLOCKS_GENERATION_KEY)
            .and_then(|v| v.parse::<i64>().ok());
        recorded == Some(cluster_generation) && self.is_generation_observed()
    }

    /// True if the component has a deletion timestamp
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True if the spec requests the component stopped
    pub fn is_stopped(&self) -> bool {
        self.spec.stop.unwrap_or(false)
    }
}
