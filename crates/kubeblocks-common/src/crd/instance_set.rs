//! InstanceSet CRD types
//!
//! An InstanceSet manages a group of pods with stable names. Unlike a
//! StatefulSet it supports per-instance template overrides, offline
//! instances, role-aware rolling updates and in-place pod updates.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSetUpdateStrategy;
use k8s_openapi::api::core::v1::{
    EnvVar, PersistentVolumeClaim, PodTemplateSpec, ResourceRequirements, Service, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cluster::{PodUpdatePolicy, SchedulingPolicy};
use super::types::Condition;

/// Pod creation and deletion ordering
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PodManagementPolicy {
    /// One pod at a time, each after its predecessors are ready
    #[default]
    OrderedReady,
    /// All pods at once
    Parallel,
}

/// Concurrency of role-aware updates
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MemberUpdateStrategy {
    /// One pod at a time
    Serial,
    /// Non-voters, then half the voters, then the rest, then the leader
    BestEffortParallel,
    /// All pods at once
    Parallel,
}

/// How clients may use a role
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AccessMode {
    /// No client access
    #[default]
    None,
    /// Read-only access
    Readonly,
    /// Read-write access
    ReadWrite,
}

/// A role a replica can hold
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaRole {
    /// Role name, as set in the pod's role label
    pub name: String,
    /// Client access mode
    #[serde(default)]
    pub access_mode: AccessMode,
    /// Takes part in quorum
    #[serde(default)]
    pub can_vote: bool,
    /// The leader role
    #[serde(default)]
    pub is_leader: bool,
}

/// An override for a subset of the instances
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplate {
    /// Template name; pods are named `<parent>-<name>-<ordinal>`
    pub name: String,
    /// Instances built from this template, default 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// First ordinal of this template's instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal_start: Option<i32>,
    /// Annotations merged into the pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Labels merged into the pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Image of the first container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Scheduling override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
    /// Resources of the first container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Environment merged into the first container by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Volumes merged by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Volume mounts merged into the first container by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    /// Volume claim templates merged by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
}

impl InstanceTemplate {
    /// Replicas, defaulting to 1
    pub fn replica_count(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }
}

/// Desired state of an InstanceSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "workloads.kubeblocks.io",
    version = "v1",
    kind = "InstanceSet",
    plural = "instancesets",
    shortname = "its",
    namespaced,
    derive = "PartialEq",
    status = "InstanceSetStatus",
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetSpec {
    /// Total instances, including those from instance templates
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Seconds a pod must be ready before it counts as available
    #[serde(default)]
    pub min_ready_seconds: i32,

    /// Pod selector
    #[serde(default)]
    pub selector: LabelSelector,

    /// Headless service name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,

    /// Client-facing service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,

    /// Base pod template
    pub template: PodTemplateSpec,

    /// Per-instance overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceTemplate>,

    /// Instance names that must not run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline_instances: Vec<String>,

    /// PVC templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,

    /// Creation and deletion ordering
    #[serde(default)]
    pub pod_management_policy: PodManagementPolicy,

    /// In-place update policy
    #[serde(default)]
    pub pod_update_policy: PodUpdatePolicy,

    /// Update strategy (OnDelete or RollingUpdate)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<StatefulSetUpdateStrategy>,

    /// Replica roles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<ReplicaRole>,

    /// Role-aware update concurrency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_update_strategy: Option<MemberUpdateStrategy>,

    /// Stop reconciling pods
    #[serde(default)]
    pub paused: bool,
}

fn default_replicas() -> i32 {
    1
}

/// Counters of one instance template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplateStatus {
    /// Template name
    pub name: String,
    /// Existing pods
    #[serde(default)]
    pub replicas: i32,
    /// Ready pods
    #[serde(default)]
    pub ready_replicas: i32,
    /// Available pods
    #[serde(default)]
    pub available_replicas: i32,
    /// Pods at the current revision
    #[serde(default)]
    pub current_replicas: i32,
    /// Pods at the update revision
    #[serde(default)]
    pub updated_replicas: i32,
}

/// Role of one pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Pod name
    pub pod_name: String,
    /// Role held
    #[serde(default, rename = "role", skip_serializing_if = "Option::is_none")]
    pub replica_role: Option<ReplicaRole>,
}

/// Observed state of an InstanceSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetStatus {
    /// Generation last processed
    #[serde(default)]
    pub observed_generation: i64,
    /// Existing pods
    #[serde(default)]
    pub replicas: i32,
    /// Ready pods
    #[serde(default)]
    pub ready_replicas: i32,
    /// Pods ready for at least minReadySeconds
    #[serde(default)]
    pub available_replicas: i32,
    /// Pods at their current revision
    #[serde(default)]
    pub current_replicas: i32,
    /// Pods at their update revision
    #[serde(default)]
    pub updated_replicas: i32,
    /// Ordinals of default-template instances
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ordinals: Vec<i32>,
    /// Instance name → revision all pods had before the current update
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub current_revisions: BTreeMap<String, String>,
    /// Instance name → desired revision
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub update_revisions: BTreeMap<String, String>,
    /// Compressed form of `current_revisions` for large sets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_current_revisions: Option<String>,
    /// Compressed form of `update_revisions` for large sets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_update_revisions: Option<String>,
    /// Per-template counters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates_status: Vec<InstanceTemplateStatus>,
    /// Pod roles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members_status: Vec<MemberStatus>,
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl InstanceSet {
    /// True if the InstanceSet has a deletion timestamp
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True while the spec has changes not yet processed
    pub fn is_updating(&self) -> bool {
        self.status
            .as_ref()
            .map_or(true, |s| Some(s.observed_generation) != self.metadata.generation)
    }
}
