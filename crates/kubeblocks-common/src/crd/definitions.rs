//! Definition CRDs: ComponentDefinition, ComponentVersion, ShardingDefinition
//! and SidecarDefinition
//!
//! Definitions are cluster-scoped blueprints referenced from clusters by
//! exact name, prefix or regex.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cluster_definition::DefinitionPhase;

// =============================================================================
// Lifecycle actions
// =============================================================================

/// Which pods of a component an action runs on
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TargetPodSelector {
    /// One pod, chosen by the operator
    #[default]
    Any,
    /// Every pod
    All,
    /// Pods with the given role
    Role,
    /// The pod with the given ordinal
    Ordinal,
}

/// Condition the target pods must meet before an action runs
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PreConditionType {
    /// Run immediately
    #[default]
    Immediately,
    /// The runtime containers are ready
    RuntimeReady,
    /// The component is ready
    ComponentReady,
    /// The cluster is ready
    ClusterReady,
}

/// A command executed in a container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecAction {
    /// Image for a dedicated action container; empty uses the target container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Command to run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Target pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pod_selector: Option<TargetPodSelector>,
    /// Role or ordinal for `Role`/`Ordinal` selectors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching_key: Option<String>,
    /// Container to exec into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// A user-defined lifecycle action
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Command execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    /// Timeout in seconds, 0 for no timeout
    #[serde(default)]
    pub timeout_seconds: i32,
    /// Precondition on the target pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_condition: Option<PreConditionType>,
}

/// Which shards a sharding action runs against
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TargetShard {
    /// One shard, chosen by the caller or at random
    #[default]
    AnyShard,
    /// Every shard
    AllShards,
}

/// An action run at sharding scope
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardingAction {
    /// The action itself
    #[serde(flatten)]
    pub action: Action,
    /// Target shards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_shard: Option<TargetShard>,
}

/// Lifecycle hooks of a sharding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardingLifecycleActions {
    /// After every shard is first provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_provision: Option<ShardingAction>,
    /// Before the sharding is terminated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_terminate: Option<ShardingAction>,
    /// After a shard is added
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_add: Option<ShardingAction>,
    /// Before a shard is removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_remove: Option<ShardingAction>,
}

// =============================================================================
// ComponentDefinition
// =============================================================================

/// Letter case of generated passwords
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LetterCase {
    /// Lowercase letters only
    LowerCases,
    /// Uppercase letters only
    UpperCases,
    /// Both
    #[default]
    MixedCases,
}

/// Password generation rules
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordConfig {
    /// Total length
    #[serde(default = "default_password_length")]
    pub length: i32,
    /// Number of digits
    #[serde(default)]
    pub num_digits: i32,
    /// Number of symbols
    #[serde(default)]
    pub num_symbols: i32,
    /// Letter case
    #[serde(default)]
    pub letter_case: LetterCase,
}

fn default_password_length() -> i32 {
    16
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            length: default_password_length(),
            num_digits: 0,
            num_symbols: 0,
            letter_case: LetterCase::default(),
        }
    }
}

/// A system account created for every component of a definition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemAccount {
    /// Account name
    pub name: String,
    /// The account is the initial superuser
    #[serde(default)]
    pub init_account: bool,
    /// Password rules
    #[serde(default)]
    pub password_generation_policy: PasswordConfig,
}

/// Blueprint of a component
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apps.kubeblocks.io",
    version = "v1",
    kind = "ComponentDefinition",
    plural = "componentdefinitions",
    shortname = "cmpd",
    status = "DefinitionStatus",
    printcolumn = r#"{"name":"Service-Version","type":"string","jsonPath":".spec.serviceVersion"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinitionSpec {
    /// Service version provided when no ComponentVersion says otherwise
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_version: String,

    /// Runtime pod spec containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,

    /// System accounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_accounts: Vec<SystemAccount>,
}

/// Observed state shared by definition CRDs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionStatus {
    /// Generation last validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Availability
    #[serde(default)]
    pub phase: DefinitionPhase,
    /// Details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// =============================================================================
// ComponentVersion
// =============================================================================

/// Which releases apply to which definitions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityRule {
    /// ComponentDefinition names, prefixes or regexes
    pub comp_defs: Vec<String>,
    /// Release names
    pub releases: Vec<String>,
}

/// One release of a service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersionRelease {
    /// Release name
    pub name: String,
    /// Service version it provides
    pub service_version: String,
    /// Container images by container name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, String>,
}

/// Releases of a service and the definitions they work with
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apps.kubeblocks.io",
    version = "v1",
    kind = "ComponentVersion",
    plural = "componentversions",
    shortname = "cmpv",
    status = "DefinitionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersionSpec {
    /// Compatibility rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compatibility_rules: Vec<CompatibilityRule>,
    /// Releases
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<ComponentVersionRelease>,
}

// =============================================================================
// ShardingDefinition
// =============================================================================

/// The ComponentDefinition shards are built from
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardingTemplate {
    /// ComponentDefinition name, prefix or regex
    pub comp_def: String,
}

/// Allowed shard count range, inclusive
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShardsLimit {
    /// Minimum shards
    pub min_shards: i32,
    /// Maximum shards
    pub max_shards: i32,
}

/// An account shared by all shards of a sharding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShardingSystemAccount {
    /// Account name, matching a ComponentDefinition system account
    pub name: String,
    /// One secret for all shards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
}

/// Blueprint of a sharding
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apps.kubeblocks.io",
    version = "v1",
    kind = "ShardingDefinition",
    plural = "shardingdefinitions",
    shortname = "sdd",
    status = "DefinitionStatus",
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.template.compDef"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ShardingDefinitionSpec {
    /// Shard template
    pub template: ShardingTemplate,
    /// Shard count range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards_limit: Option<ShardsLimit>,
    /// Lifecycle hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_actions: Option<ShardingLifecycleActions>,
    /// Accounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_accounts: Vec<ShardingSystemAccount>,
}

impl ShardingDefinition {
    /// Lifecycle hooks, empty when none are declared
    pub fn lifecycle_actions(&self) -> ShardingLifecycleActions {
        self.spec.lifecycle_actions.clone().unwrap_or_default()
    }
}

// =============================================================================
// SidecarDefinition
// =============================================================================

/// Blueprint of a sidecar injected into components
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apps.kubeblocks.io",
    version = "v1",
    kind = "SidecarDefinition",
    plural = "sidecardefinitions",
    shortname = "sidecardef",
    status = "SidecarDefinitionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SidecarDefinitionSpec {
    /// Sidecar name
    pub name: String,
    /// ComponentDefinition name pattern owning the sidecar
    pub owner: String,
    /// ComponentDefinition name patterns the sidecar is injected into
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<String>,
    /// Sidecar containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,
}

/// Observed state of a SidecarDefinition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SidecarDefinitionStatus {
    /// Generation last validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Availability
    #[serde(default)]
    pub phase: DefinitionPhase,
    /// Comma-joined ComponentDefinitions matching the owner pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owners: Option<String>,
    /// Comma-joined ComponentDefinitions matching the selectors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<String>,
}

/// Availability check shared by the definition kinds
pub trait Available {
    /// True once the definition is validated for its current generation
    fn is_available(&self) -> bool;
}

macro_rules! impl_available {
    ($kind:ty) => {
        impl Available for $kind {
            fn is_available(&self) -> bool {
                self.status.as_ref().is_some_and(|s| {
                    s.phase == DefinitionPhase::Available
                        && s.observed_generation == self.metadata.generation
                })
            }
        }
    };
}

impl_available!(ComponentDefinition);
impl_available!(ComponentVersion);
impl_available!(ShardingDefinition);
impl_available!(SidecarDefinition);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharding_action_flattens_action_fields() {
        let action: ShardingAction = serde_json::from_str(
            r#"{"exec":{"command":["/bin/sh","-c","echo"]},"timeoutSeconds":5,"targetShard":"AllShards"}"#,
        )
        .unwrap();
        assert_eq!(action.target_shard, Some(TargetShard::AllShards));
        assert_eq!(action.action.timeout_seconds, 5);
        assert!(action.action.exec.is_some());
    }

    #[test]
    fn test_availability_requires_current_generation() {
        let mut def = ComponentDefinition::new("mysql-8.0", ComponentDefinitionSpec::default());
        def.metadata.generation = Some(2);
        assert!(!def.is_available());

        def.status = Some(DefinitionStatus {
            observed_generation: Some(1),
            phase: DefinitionPhase::Available,
            message: None,
        });
        assert!(!def.is_available());

        if let Some(status) = def.status.as_mut() {
            status.observed_generation = Some(2);
        }
        assert!(def.is_available());
    }

    #[test]
    fn test_password_config_defaults() {
        let config: PasswordConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.length, 16);
        assert_eq!(config.letter_case, LetterCase::MixedCases);
    }
}
