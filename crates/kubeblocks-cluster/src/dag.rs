//! Per-pass mutation log
//!
//! Transformers never write to the store. They append vertices here, and
//! the executor applies them in insertion order once the chain finishes.
//! Later transformers query the graph to see what earlier ones decided in the
//! same pass, e.g. whether a predecessor is about to be created.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use kubeblocks_common::constants::SHARDING_NAME_LABEL;
use kubeblocks_common::crd::{Cluster, Component};

use crate::store::OwnedKind;

/// What to do with a vertex's object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// Create the object
    Create,
    /// Replace metadata and spec
    Update,
    /// Delete the object
    Delete,
    /// Write the status subresource
    Status,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "Create"),
            Self::Update => write!(f, "Update"),
            Self::Delete => write!(f, "Delete"),
            Self::Status => write!(f, "Status"),
        }
    }
}

/// An object touched by a reconcile pass
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterObject {
    /// The cluster itself
    Cluster(Box<Cluster>),
    /// A component or shard
    Component(Box<Component>),
    /// A secret, e.g. a shared account password
    Secret(Box<Secret>),
    /// An owned object known only by kind and name
    Owned {
        /// Object kind
        kind: OwnedKind,
        /// Namespace
        namespace: String,
        /// Object name
        name: String,
    },
}

impl ClusterObject {
    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::Cluster(c) => c.name_any(),
            Self::Component(c) => c.name_any(),
            Self::Secret(s) => s.name_any(),
            Self::Owned { name, .. } => name.clone(),
        }
    }

    /// Kind, for logs
    pub fn kind(&self) -> String {
        match self {
            Self::Cluster(_) => "Cluster".to_string(),
            Self::Component(_) => "Component".to_string(),
            Self::Secret(_) => "Secret".to_string(),
            Self::Owned { kind, .. } => kind.to_string(),
        }
    }

    fn as_component(&self) -> Option<&Component> {
        match self {
            Self::Component(c) => Some(c),
            _ => None,
        }
    }
}

/// One recorded mutation
#[derive(Clone, Debug, PartialEq)]
pub struct Vertex {
    /// Action
    pub verb: Verb,
    /// Target
    pub object: ClusterObject,
}

/// Append-only list of mutations for one pass
#[derive(Clone, Debug, Default)]
pub struct MutationGraph {
    vertices: Vec<Vertex>,
}

impl MutationGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutation
    pub fn add(&mut self, verb: Verb, object: ClusterObject) {
        self.vertices.push(Vertex { verb, object });
    }

    /// Record a component create
    pub fn create_component(&mut self, component: Component) {
        self.add(Verb::Create, ClusterObject::Component(Box::new(component)));
    }

    /// Record a component update
    pub fn update_component(&mut self, component: Component) {
        self.add(Verb::Update, ClusterObject::Component(Box::new(component)));
    }

    /// Record a component delete
    pub fn delete_component(&mut self, component: Component) {
        self.add(Verb::Delete, ClusterObject::Component(Box::new(component)));
    }

    /// All vertices, in insertion order
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    /// Number of vertices
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Drop everything recorded so far
    pub fn clear(&mut self) {
        self.vertices.clear();
    }

    fn components(&self) -> impl Iterator<Item = (Verb, &Component)> {
        self.vertices
            .iter()
            .filter_map(|v| v.object.as_component().map(|c| (v.verb, c)))
    }

    /// True if any vertex touches the component with this full name
    pub fn has_component(&self, name: &str) -> bool {
        self.components().any(|(_, c)| c.name_any() == name)
    }

    /// True if a create vertex exists for the component with this full name
    pub fn has_create(&self, name: &str) -> bool {
        self.components()
            .any(|(verb, c)| verb == Verb::Create && c.name_any() == name)
    }

    /// True if any vertex touches a shard of the sharding
    pub fn has_sharding_vertex(&self, sharding: &str) -> bool {
        self.components()
            .any(|(_, c)| c.label(SHARDING_NAME_LABEL) == Some(sharding))
    }

    /// True if a create vertex exists for a shard of the sharding
    pub fn has_sharding_create(&self, sharding: &str) -> bool {
        self.components().any(|(verb, c)| {
            verb == Verb::Create && c.label(SHARDING_NAME_LABEL) == Some(sharding)
        })
    }

    /// Components with create vertices, in insertion order
    pub fn components_created(&self) -> Vec<&Component> {
        self.components()
            .filter(|(verb, _)| *verb == Verb::Create)
            .map(|(_, c)| c)
            .collect()
    }

    /// Full names of components with vertices of the given verb
    pub fn component_names(&self, verb: Verb) -> Vec<String> {
        self.components()
            .filter(|(v, _)| *v == verb)
            .map(|(_, c)| c.name_any())
            .collect()
    }
}
