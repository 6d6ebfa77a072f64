//! ClusterDefinition CRD types
//!
//! A ClusterDefinition publishes named topologies: which component and
//! sharding slots a cluster has, which definitions they default to, and in
//! which order they are provisioned, updated and terminated.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Availability of a definition object
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DefinitionPhase {
    /// The definition passed validation and can be used
    Available,
    /// The definition is not usable
    #[default]
    Unavailable,
}

/// A component slot of a topology
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopologyComponent {
    /// Slot name; for template slots, a prefix of component names
    pub name: String,

    /// Default ComponentDefinition name, prefix or regex
    pub comp_def: String,

    /// Template slots only match user-declared components and are never
    /// instantiated implicitly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<bool>,
}

impl ClusterTopologyComponent {
    /// True for template slots
    pub fn is_template(&self) -> bool {
        self.template.unwrap_or(false)
    }

    /// True if a component called `name` belongs to this slot
    pub fn matches(&self, name: &str) -> bool {
        self.name == name || (self.is_template() && name.starts_with(&self.name))
    }
}

/// A sharding slot of a topology
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopologySharding {
    /// Sharding name
    pub name: String,

    /// Default ShardingDefinition name, prefix or regex
    pub sharding_def: String,
}

/// Orders of a topology
///
/// Each entry is a comma-separated group of slot names. Groups run in
/// sequence; names within a group are unordered.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopologyOrders {
    /// Creation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provision: Vec<String>,

    /// Deletion order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terminate: Vec<String>,

    /// Update order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<String>,
}

/// A named topology
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    /// Topology name
    pub name: String,

    /// Component slots
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ClusterTopologyComponent>,

    /// Sharding slots
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shardings: Vec<ClusterTopologySharding>,

    /// Operation orders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orders: Option<ClusterTopologyOrders>,

    /// Used when a cluster names no topology
    #[serde(default)]
    pub default: bool,
}

impl ClusterTopology {
    /// True if `name` is a component of this topology
    pub fn has_component(&self, name: &str) -> bool {
        self.components.iter().any(|c| c.matches(name))
    }

    /// Sharding slot by name
    pub fn sharding(&self, name: &str) -> Option<&ClusterTopologySharding> {
        self.shardings.iter().find(|s| s.name == name)
    }
}

/// Blueprint for the shape of a cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apps.kubeblocks.io",
    version = "v1",
    kind = "ClusterDefinition",
    plural = "clusterdefinitions",
    shortname = "cd",
    status = "ClusterDefinitionStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDefinitionSpec {
    /// Available topologies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topologies: Vec<ClusterTopology>,
}

/// Observed state of a ClusterDefinition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDefinitionStatus {
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

impl ClusterDefinition {
    /// Topology by name, or the default topology when `name` is empty
    pub fn topology(&self, name: &str) -> Option<&ClusterTopology> {
        if name.is_empty() {
            return self.spec.topologies.iter().find(|t| t.default);
        }
        self.spec.topologies.iter().find(|t| t.name == name)
    }

    /// True once the definition is validated for its current generation
    pub fn is_available(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.phase == DefinitionPhase::Available
                && s.observed_generation == self.metadata.generation
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> ClusterDefinition {
        ClusterDefinition::new(
            "apecloud-mysql",
            ClusterDefinitionSpec {
                topologies: vec![
                    ClusterTopology {
                        name: "standalone".to_string(),
                        default: true,
                        ..Default::default()
                    },
                    ClusterTopology {
                        name: "proxy".to_string(),
                        ..Default::default()
                    },
                ],
            },
        )
    }

    #[test]
    fn test_empty_name_selects_default_topology() {
        let def = definition();
        assert_eq!(def.topology("").map(|t| t.name.as_str()), Some("standalone"));
        assert_eq!(def.topology("proxy").map(|t| t.name.as_str()), Some("proxy"));
        assert!(def.topology("missing").is_none());
    }

    #[test]
    fn test_template_slot_matches_prefix() {
        let slot = ClusterTopologyComponent {
            name: "proxy".to_string(),
            comp_def: "proxy".to_string(),
            template: Some(true),
        };
        assert!(slot.matches("proxy"));
        assert!(slot.matches("proxy-2"));
        assert!(!slot.matches("mysql"));

        let plain = ClusterTopologyComponent {
            template: None,
            ..slot
        };
        assert!(!plain.matches("proxy-2"));
    }

    #[test]
    fn test_orders_deserialize() {
        let orders: ClusterTopologyOrders =
            serde_json::from_str(r#"{"provision":["a","b,c","d"]}"#).unwrap();
        assert_eq!(orders.provision.len(), 3);
        assert!(orders.terminate.is_empty());
    }
}
