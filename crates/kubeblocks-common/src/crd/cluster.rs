//! Cluster CRD types
//!
//! A `Cluster` declares named components and shardings, optionally through a
//! topology of a `ClusterDefinition`. The operator resolves it into
//! `Component` objects, one per component and one per shard.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, PersistentVolumeClaimSpec, ResourceRequirements, Toleration,
    TopologySpreadConstraint, Volume,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

// =============================================================================
// Phases
// =============================================================================

/// Phase of a Cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    /// All components are being created
    Creating,
    /// All components are running
    Running,
    /// Components are being created or updated
    Updating,
    /// At least one component is stopping
    Stopping,
    /// All components are stopped
    Stopped,
    /// The cluster is being deleted
    Deleting,
    /// All components failed
    Failed,
    /// Some components failed
    Abnormal,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Updating => write!(f, "Updating"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
            Self::Abnormal => write!(f, "Abnormal"),
        }
    }
}

/// Phase of a Component, or of a sharding seen as one virtual component
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ComponentPhase {
    /// Workloads are being created
    Creating,
    /// Stopped workloads are starting
    Starting,
    /// All replicas are running
    Running,
    /// Workloads are being updated
    Updating,
    /// Workloads are stopping
    Stopping,
    /// Workloads are stopped
    Stopped,
    /// Workloads failed
    Failed,
    /// Some replicas failed
    Abnormal,
    /// The component is being deleted
    Deleting,
}

impl std::fmt::Display for ComponentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Updating => write!(f, "Updating"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
            Self::Abnormal => write!(f, "Abnormal"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

/// What happens to a cluster's resources when it is deleted
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Deletion is refused
    DoNotTerminate,
    /// Runtime resources are deleted, backups are kept
    #[default]
    Delete,
    /// Runtime resources and backups are deleted
    WipeOut,
}

impl std::fmt::Display for TerminationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DoNotTerminate => write!(f, "DoNotTerminate"),
            Self::Delete => write!(f, "Delete"),
            Self::WipeOut => write!(f, "WipeOut"),
        }
    }
}

/// Whether a pod update may recreate the pod
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PodUpdatePolicy {
    /// Update in place when possible, else recreate
    #[default]
    PreferInPlace,
    /// Only update in place; block when recreation would be needed
    StrictInPlace,
}

// =============================================================================
// Shared spec pieces
// =============================================================================

/// Pod scheduling constraints
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingPolicy {
    /// Scheduler to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
    /// Node label selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Pin to a node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Pod affinity rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Topology spread constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
}

/// A persistent volume claim template of a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    /// Volume name, referenced by container mounts
    pub name: String,
    /// Extra labels on the PVC
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Extra annotations on the PVC
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// PVC spec
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

/// A service exposed by a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentService {
    /// Service name
    pub name: String,
    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    /// Annotations on the Service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Create one Service per pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_service: Option<bool>,
}

/// Per-instance override within a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentInstanceTemplate {
    /// Template name, part of generated pod names
    pub name: String,
    /// Replicas built from this template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// ComponentDefinition for these instances, defaults to the component's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comp_def: Option<String>,
    /// Service version for these instances, defaults to the component's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
    /// Image override for the first container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Extra labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Extra annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Resource override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Desired state of one component of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentSpec {
    /// Component name, unique within the cluster
    pub name: String,

    /// ComponentDefinition name, prefix or regex
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component_def: String,

    /// Requested service version or range
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_version: String,

    /// Extra labels for the component's objects
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations for the component's objects
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Extra environment variables for all containers
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

    /// Services to expose
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
}

impl ClusterComponentSpec {
    /// True if the component is requested stopped
    pub fn is_stopped(&self) -> bool {
        self.stop.unwrap_or(false)
    }
}

// =============================================================================
// Sharding
// =============================================================================

/// Overrides for a subset of the shards of a sharding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardTemplate {
    /// Template name, recorded on the shards built from it
    pub name: String,

    /// Number of shards built from this template, defaults to the number of shard ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<i32>,

    /// Existing shard ids taken over by this template
    #[serde(default, rename = "shardIDs", skip_serializing_if = "Vec::is_empty")]
    pub shard_ids: Vec<String>,

    /// ShardingDefinition override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding_def: Option<String>,

    /// ComponentDefinition override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comp_def: Option<String>,

    /// Service version override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,

    /// Replicas override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Labels merged over the default template's
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations merged over the default template's
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Environment variables merged over the default template's
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Scheduling policy override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,

    /// Resources override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Volume claim templates override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,
}

impl ShardTemplate {
    /// Shards requested by this template
    pub fn shard_count(&self) -> i32 {
        self.shards.unwrap_or(self.shard_ids.len() as i32)
    }
}

/// A set of identical shards, each materialized as one Component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSharding {
    /// Sharding name, unique within the cluster
    pub name: String,

    /// ShardingDefinition name, prefix or regex
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sharding_def: String,

    /// Spec shared by every shard
    pub template: ClusterComponentSpec,

    /// Named overrides for subsets of shards
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shard_templates: Vec<ShardTemplate>,

    /// Total number of shards
    #[serde(default)]
    pub shards: i32,

    /// Full names of shard Components that must not run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offline: Vec<String>,
}

// =============================================================================
// CRD
// =============================================================================

/// Desired state of a database cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apps.kubeblocks.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    shortname = "cl",
    namespaced,
    derive = "PartialEq",
    status = "ClusterStatus",
    printcolumn = r#"{"name":"ClusterDefinition","type":"string","jsonPath":".spec.clusterDef"}"#,
    printcolumn = r#"{"name":"Termination-Policy","type":"string","jsonPath":".spec.terminationPolicy"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// ClusterDefinition providing the topology
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_def: String,

    /// Topology name within the ClusterDefinition; empty selects the default
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topology: String,

    /// What happens on deletion
    #[serde(default)]
    pub termination_policy: TerminationPolicy,

    /// Components of the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component_specs: Vec<ClusterComponentSpec>,

    /// Shardings of the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shardings: Vec<ClusterSharding>,

    /// Runtime class for all pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,

    /// Scheduling policy applied to components without their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
}

// =============================================================================
// Status
// =============================================================================

/// Phase of a lifecycle action run by the operator
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ActionPhase {
    /// Recorded, not yet attempted
    Pending,
    /// Being executed
    Running,
    /// Completed successfully
    Succeeded,
    /// Last attempt failed; retried on the next pass
    Failed,
    /// Not defined or not applicable
    Skipped,
}

impl ActionPhase {
    /// Succeeded and Skipped are final
    pub fn is_done(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

/// Progress of one lifecycle action
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleActionStatus {
    /// Current phase
    pub phase: ActionPhase,
    /// Details, e.g. the last error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the action started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the action finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl LifecycleActionStatus {
    /// A status in the given phase with no details
    pub fn with_phase(phase: ActionPhase) -> Self {
        Self {
            phase,
            message: None,
            start_time: None,
            completion_time: None,
        }
    }
}

/// Status of one component within the cluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentStatus {
    /// Phase, absent while unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ComponentPhase>,
    /// Details keyed by object (e.g. `Pod/name`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message: BTreeMap<String, String>,
}

/// Status of one sharding within the cluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterShardingStatus {
    /// Phase composed from the shards, absent while unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ComponentPhase>,
    /// Details keyed by shard
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message: BTreeMap<String, String>,
    /// Resolved ShardingDefinition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding_def: Option<String>,
    /// Post-provision action progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_provision: Option<LifecycleActionStatus>,
    /// Pre-terminate action progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_terminate: Option<LifecycleActionStatus>,
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Generation last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Composed phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,
    /// Human-readable summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Per-component status
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ClusterComponentStatus>,
    /// Per-sharding status
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shardings: BTreeMap<String, ClusterShardingStatus>,
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Cluster {
    /// Metadata generation, 0 when unset
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// Namespace, empty when unset
    pub fn namespace_or_default(&self) -> String {
        self.metadata.namespace.clone().unwrap_or_default()
    }

    /// Annotation value, if present
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// True if the cluster has a deletion timestamp
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True while the spec has changes not yet processed
    pub fn is_updating(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.observed_generation)
            .map_or(true, |observed| observed != self.generation())
    }

    /// Component spec by name
    pub fn component_spec(&self, name: &str) -> Option<&ClusterComponentSpec> {
        self.spec.component_specs.iter().find(|c| c.name == name)
    }

    /// Sharding spec by name
    pub fn sharding(&self, name: &str) -> Option<&ClusterSharding> {
        self.spec.shardings.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sample_cluster() -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some("mycluster".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(2),
                ..Default::default()
            },
            spec: ClusterSpec {
                cluster_def: "apecloud-mysql".to_string(),
                component_specs: vec![ClusterComponentSpec {
                    name: "mysql".to_string(),
                    replicas: 3,
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let json = serde_json::to_value(&sample_cluster().spec).unwrap();
        assert_eq!(json["clusterDef"], "apecloud-mysql");
        assert_eq!(json["terminationPolicy"], "Delete");
        assert_eq!(json["componentSpecs"][0]["replicas"], 3);
        assert!(json.get("shardings").is_none());
    }

    #[test]
    fn test_shard_template_ids_round_trip_field_name() {
        let template: ShardTemplate =
            serde_json::from_str(r#"{"name":"big","shardIDs":["abc","def"]}"#).unwrap();
        assert_eq!(template.shard_ids, vec!["abc", "def"]);
        assert_eq!(template.shard_count(), 2);
    }

    #[test]
    fn test_is_updating_tracks_observed_generation() {
        let mut cluster = sample_cluster();
        assert!(cluster.is_updating());

        cluster.status = Some(ClusterStatus {
            observed_generation: Some(2),
            ..Default::default()
        });
        assert!(!cluster.is_updating());
    }

    #[test]
    fn test_action_phase_done() {
        assert!(ActionPhase::Succeeded.is_done());
        assert!(ActionPhase::Skipped.is_done());
        assert!(!ActionPhase::Failed.is_done());
        assert!(!ActionPhase::Pending.is_done());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ClusterPhase::Abnormal.to_string(), "Abnormal");
        assert_eq!(ComponentPhase::Starting.to_string(), "Starting");
        assert_eq!(TerminationPolicy::WipeOut.to_string(), "WipeOut");
    }
}
