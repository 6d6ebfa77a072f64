//! Custom Resource Definitions for KubeBlocks
//!
//! This module contains all CRD definitions used by the KubeBlocks operator.

mod cluster;
mod cluster_definition;
mod component;
mod definitions;
mod instance_set;
mod types;

pub use cluster::{
    ActionPhase, Cluster, ClusterComponentSpec, ClusterComponentStatus, ClusterPhase,
    ClusterSharding, ClusterShardingStatus, ClusterSpec, ClusterStatus, ComponentInstanceTemplate,
    ComponentPhase, ComponentService, LifecycleActionStatus, PodUpdatePolicy, SchedulingPolicy,
    ShardTemplate, TerminationPolicy, VolumeClaimTemplate,
};
pub use cluster_definition::{
    ClusterDefinition, ClusterDefinitionSpec, ClusterDefinitionStatus, ClusterTopology,
    ClusterTopologyComponent, ClusterTopologyOrders, ClusterTopologySharding, DefinitionPhase,
};
pub use component::{Component, ComponentSpec, ComponentStatus, Sidecar};
pub use definitions::{
    Action, Available, CompatibilityRule, ComponentDefinition, ComponentDefinitionSpec,
    ComponentVersion, ComponentVersionRelease, ComponentVersionSpec, DefinitionStatus, ExecAction,
    LetterCase, PasswordConfig, PreConditionType, ShardingAction, ShardingDefinition,
    ShardingDefinitionSpec, ShardingLifecycleActions, ShardingSystemAccount, ShardingTemplate,
    ShardsLimit, SidecarDefinition, SidecarDefinitionSpec, SidecarDefinitionStatus, SystemAccount,
    TargetPodSelector, TargetShard,
};
pub use instance_set::{
    AccessMode, InstanceSet, InstanceSetSpec, InstanceSetStatus, InstanceTemplate,
    InstanceTemplateStatus, MemberStatus, MemberUpdateStrategy, PodManagementPolicy, ReplicaRole,
};
pub use types::{find_condition, remove_condition, set_condition, Condition, ConditionStatus};
