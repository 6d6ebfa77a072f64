//! Well-known label, annotation and variable names
//!
//! These strings are persisted on objects and read back on later passes, so
//! changing any of them breaks upgrades of running clusters.

// =============================================================================
// Labels
// =============================================================================

/// Cluster name on every object the operator creates
pub const APP_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// Managing controller on every object the operator creates
pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`APP_MANAGED_BY_LABEL`]
pub const APP_MANAGED_BY_VALUE: &str = "kubeblocks";
/// Short component name (without the cluster prefix)
pub const COMPONENT_NAME_LABEL: &str = "apps.kubeblocks.io/component-name";
/// Sharding a shard Component belongs to
pub const SHARDING_NAME_LABEL: &str = "apps.kubeblocks.io/sharding-name";
/// Shard template a shard Component was built from (absent for the default template)
pub const SHARD_TEMPLATE_LABEL: &str = "apps.kubeblocks.io/shard-template";
/// ShardingDefinition a shard Component was built from
pub const SHARDING_DEF_LABEL: &str = "sharding.kubeblocks.io/sharding-def";
/// ClusterDefinition name on a Cluster
pub const CLUSTER_DEF_LABEL: &str = "clusterdefinition.kubeblocks.io/name";
/// ComponentDefinition name on a Component
pub const COMPONENT_DEF_LABEL: &str = "componentdefinition.kubeblocks.io/name";
/// System account name on an account secret
pub const SYSTEM_ACCOUNT_LABEL: &str = "apps.kubeblocks.io/system-account";
/// Role label maintained on pods by the role probe
pub const ROLE_LABEL: &str = "kubeblocks.io/role";
/// Volume claim template name on a PVC
pub const VOLUME_CLAIM_TEMPLATE_LABEL: &str = "apps.kubeblocks.io/vct-name";
/// Pod revision label
pub const REVISION_LABEL: &str = "controller-revision-hash";
/// Pod name label on pods and their PVCs
pub const POD_NAME_LABEL: &str = "apps.kubeblocks.io/pod-name";
/// Instance template a pod was built from
pub const INSTANCE_TEMPLATE_LABEL: &str = "workloads.kubeblocks.io/instance-template";
/// Owning InstanceSet name
pub const INSTANCE_SET_NAME_LABEL: &str = "workloads.kubeblocks.io/instance";
/// Legacy owner label emitted in compatibility mode
pub const RSM_NAME_LABEL: &str = "rsm.workloads.kubeblocks.io/instance";

// =============================================================================
// Annotations
// =============================================================================

/// Cluster generation that produced a Component's spec
pub const KUBEBLOCKS_GENERATION_KEY: &str = "kubeblocks.io/generation";
/// CRD API version the cluster objects were written with
pub const CRD_API_VERSION_ANNOTATION: &str = "kubeblocks.io/crd-api-version";
/// JSON map of restore sources keyed by component or sharding name
pub const RESTORE_FROM_BACKUP_ANNOTATION: &str = "kubeblocks.io/restore-from-backup";
/// Comma-joined list of placement contexts
pub const MULTI_CLUSTER_PLACEMENT_ANNOTATION: &str = "apps.kubeblocks.io/multi-cluster-placement";
/// Comma-joined component or sharding names that use host networking
pub const HOST_NETWORK_ANNOTATION: &str = "kubeblocks.io/host-network";
/// Comma-joined sharding names that opt in to shard pod anti-affinity
pub const SHARD_POD_ANTI_AFFINITY_ANNOTATION: &str = "apps.kubeblocks.io/shard-pod-anti-affinity";
/// Set on a shard Component when it is created; cleared once ShardAdd succeeds
pub const SHARDING_ADD_ANNOTATION: &str = "kubeblocks.io/sharding-add";
/// Set on a shard Component once ShardRemove succeeded
pub const SHARDING_REMOVE_DONE_ANNOTATION: &str = "kubeblocks.io/sharding-remove-done";
/// Set on a Component removed by scale-in rather than cluster deletion
pub const COMPONENT_SCALE_IN_ANNOTATION: &str = "apps.kubeblocks.io/component-scale-in";
/// Hash of a pod's template with every in-place updatable field stripped
pub const POD_SPEC_HASH_ANNOTATION: &str = "workloads.kubeblocks.io/pod-spec-hash";

// =============================================================================
// Finalizers
// =============================================================================

/// Finalizer on Cluster objects
pub const CLUSTER_FINALIZER: &str = "cluster.kubeblocks.io/finalizer";
/// Finalizer on InstanceSet objects
pub const INSTANCE_SET_FINALIZER: &str = "instanceset.workloads.kubeblocks.io/finalizer";

// =============================================================================
// API versions
// =============================================================================

/// Current `apps.kubeblocks.io` API version
pub const APPS_API_VERSION: &str = "apps.kubeblocks.io/v1";
/// Current `workloads.kubeblocks.io` API version
pub const WORKLOADS_API_VERSION: &str = "workloads.kubeblocks.io/v1";

// =============================================================================
// Lifecycle actions
// =============================================================================

/// Variable carrying the added shard's name into the ShardAdd action
pub const ADD_SHARD_NAME_VAR: &str = "KB_ADD_SHARD_NAME";
/// Variable carrying the removed shard's name into the ShardRemove action
pub const REMOVE_SHARD_NAME_VAR: &str = "KB_REMOVE_SHARD_NAME";
/// Action name for sharding post-provision
pub const ACTION_POST_PROVISION: &str = "shardingPostProvision";
/// Action name for sharding pre-terminate
pub const ACTION_PRE_TERMINATE: &str = "shardingPreTerminate";
/// Action name for shard add
pub const ACTION_SHARD_ADD: &str = "shardingShardAdd";
/// Action name for shard remove
pub const ACTION_SHARD_REMOVE: &str = "shardingShardRemove";

// =============================================================================
// Helpers
// =============================================================================

/// Full object name of a component: `<cluster>-<component>`
pub fn component_full_name(cluster: &str, component: &str) -> String {
    format!("{}-{}", cluster, component)
}

/// Short component name from a full object name
pub fn component_short_name(cluster: &str, full_name: &str) -> String {
    full_name
        .strip_prefix(cluster)
        .and_then(|rest| rest.strip_prefix('-'))
        .unwrap_or(full_name)
        .to_string()
}

/// Parse a comma-joined annotation value into trimmed, non-empty entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
