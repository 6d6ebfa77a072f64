//! Object tree snapshot of one InstanceSet
//!
//! The tree holds the root InstanceSet and every secondary object it owns,
//! keyed by kind and name. Reconcilers edit the tree in place; [`ObjectTree::plan`]
//! turns the difference between the edited tree and the loaded snapshot into
//! the writes of the pass.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use kube::ResourceExt;

use kubeblocks_common::constants::INSTANCE_SET_FINALIZER;
use kubeblocks_common::crd::InstanceSet;
use kubeblocks_common::{Error, Result};

/// Secondary object kinds, in creation order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Env and config maps
    ConfigMap,
    /// Headless and client services
    Service,
    /// Instance volumes
    PersistentVolumeClaim,
    /// Instance pods
    Pod,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigMap => write!(f, "ConfigMap"),
            Self::Service => write!(f, "Service"),
            Self::PersistentVolumeClaim => write!(f, "PersistentVolumeClaim"),
            Self::Pod => write!(f, "Pod"),
        }
    }
}

/// A secondary object held by the tree
#[derive(Clone, Debug, PartialEq)]
pub enum TreeObject {
    /// A config map
    ConfigMap(Box<ConfigMap>),
    /// A service
    Service(Box<Service>),
    /// A persistent volume claim
    Pvc(Box<PersistentVolumeClaim>),
    /// A pod
    Pod(Box<Pod>),
}

impl TreeObject {
    /// Kind of the object
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::ConfigMap(_) => ObjectKind::ConfigMap,
            Self::Service(_) => ObjectKind::Service,
            Self::Pvc(_) => ObjectKind::PersistentVolumeClaim,
            Self::Pod(_) => ObjectKind::Pod,
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::ConfigMap(o) => o.name_any(),
            Self::Service(o) => o.name_any(),
            Self::Pvc(o) => o.name_any(),
            Self::Pod(o) => o.name_any(),
        }
    }

    /// Object namespace
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::ConfigMap(o) => o.namespace(),
            Self::Service(o) => o.namespace(),
            Self::Pvc(o) => o.namespace(),
            Self::Pod(o) => o.namespace(),
        }
    }

    fn key(&self) -> (ObjectKind, String) {
        (self.kind(), self.name())
    }
}

impl From<Pod> for TreeObject {
    fn from(pod: Pod) -> Self {
        Self::Pod(Box::new(pod))
    }
}

impl From<PersistentVolumeClaim> for TreeObject {
    fn from(pvc: PersistentVolumeClaim) -> Self {
        Self::Pvc(Box::new(pvc))
    }
}

impl From<Service> for TreeObject {
    fn from(svc: Service) -> Self {
        Self::Service(Box::new(svc))
    }
}

impl From<ConfigMap> for TreeObject {
    fn from(cm: ConfigMap) -> Self {
        Self::ConfigMap(Box::new(cm))
    }
}

/// One write computed from the tree
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Create a secondary object
    Create(TreeObject),
    /// Replace a secondary object
    Update(TreeObject),
    /// Delete a secondary object
    Delete(TreeObject),
    /// Replace the root's metadata and spec
    UpdateRoot(Box<InstanceSet>),
    /// Write the root's status subresource
    RootStatus(Box<InstanceSet>),
}

impl Mutation {
    /// Short description for logs and test assertions, e.g. `create Pod its-0`
    pub fn describe(&self) -> String {
        match self {
            Self::Create(o) => format!("create {} {}", o.kind(), o.name()),
            Self::Update(o) => format!("update {} {}", o.kind(), o.name()),
            Self::Delete(o) => format!("delete {} {}", o.kind(), o.name()),
            Self::UpdateRoot(its) => format!("update InstanceSet {}", its.name_any()),
            Self::RootStatus(its) => format!("status InstanceSet {}", its.name_any()),
        }
    }
}

/// An event raised by a reconciler, published after the writes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEvent {
    /// Warning rather than Normal
    pub warning: bool,
    /// Machine-readable reason
    pub reason: String,
    /// Action taken
    pub action: String,
    /// Human-readable message
    pub note: String,
}

/// Working copy of an InstanceSet and its secondary objects
#[derive(Clone, Debug)]
pub struct ObjectTree {
    root: Option<InstanceSet>,
    orig_root: InstanceSet,
    objects: BTreeMap<(ObjectKind, String), TreeObject>,
    orig_objects: BTreeMap<(ObjectKind, String), TreeObject>,
    events: Vec<TreeEvent>,
    now: DateTime<Utc>,
}

impl ObjectTree {
    /// A tree of `root` with no secondary objects, observed at `now`
    pub fn new(root: InstanceSet, now: DateTime<Utc>) -> Self {
        Self {
            root: Some(root.clone()),
            orig_root: root,
            objects: BTreeMap::new(),
            orig_objects: BTreeMap::new(),
            events: Vec::new(),
            now,
        }
    }

    /// Add loaded secondary objects to the snapshot
    pub fn with_objects(mut self, objects: impl IntoIterator<Item = TreeObject>) -> Self {
        for object in objects {
            self.orig_objects.insert(object.key(), object.clone());
            self.objects.insert(object.key(), object);
        }
        self
    }

    /// The root, unless it has been released
    pub fn root(&self) -> Option<&InstanceSet> {
        self.root.as_ref()
    }

    /// Mutable root, unless it has been released
    pub fn root_mut(&mut self) -> Option<&mut InstanceSet> {
        self.root.as_mut()
    }

    /// The root as loaded
    pub fn orig_root(&self) -> &InstanceSet {
        &self.orig_root
    }

    /// Time the tree was loaded, used for availability checks
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Look up an object
    pub fn get(&self, kind: ObjectKind, name: &str) -> Option<&TreeObject> {
        self.objects.get(&(kind, name.to_string()))
    }

    /// Objects of a kind, ordered by name
    pub fn list(&self, kind: ObjectKind) -> Vec<&TreeObject> {
        self.objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, o)| o)
            .collect()
    }

    /// A pod by name
    pub fn pod(&self, name: &str) -> Option<&Pod> {
        match self.get(ObjectKind::Pod, name) {
            Some(TreeObject::Pod(pod)) => Some(pod),
            _ => None,
        }
    }

    /// All pods, ordered by name
    pub fn pods(&self) -> Vec<&Pod> {
        self.list(ObjectKind::Pod)
            .into_iter()
            .filter_map(|o| match o {
                TreeObject::Pod(pod) => Some(pod.as_ref()),
                _ => None,
            })
            .collect()
    }

    /// A persistent volume claim by name
    pub fn pvc(&self, name: &str) -> Option<&PersistentVolumeClaim> {
        match self.get(ObjectKind::PersistentVolumeClaim, name) {
            Some(TreeObject::Pvc(pvc)) => Some(pvc),
            _ => None,
        }
    }

    /// Add a new object; adding an object that already exists is a bug
    pub fn add(&mut self, object: impl Into<TreeObject>) -> Result<()> {
        let object = object.into();
        let key = object.key();
        if self.objects.contains_key(&key) {
            return Err(Error::impossible(format!(
                "{} {} is already in the tree",
                key.0, key.1
            )));
        }
        self.objects.insert(key, object);
        Ok(())
    }

    /// Replace an existing object
    pub fn update(&mut self, object: impl Into<TreeObject>) -> Result<()> {
        let object = object.into();
        let key = object.key();
        match self.objects.get_mut(&key) {
            Some(existing) => {
                *existing = object;
                Ok(())
            }
            None => Err(Error::not_found(key.0.to_string(), key.1)),
        }
    }

    /// Remove an object, returning it if it was present
    pub fn delete(&mut self, kind: ObjectKind, name: &str) -> Option<TreeObject> {
        self.objects.remove(&(kind, name.to_string()))
    }

    /// True while any secondary object remains
    pub fn has_secondary_objects(&self) -> bool {
        !self.objects.is_empty()
    }

    /// Remove every secondary object
    pub fn delete_secondary_objects(&mut self) {
        self.objects.clear();
    }

    /// Release the root: its finalizer is removed when the plan is applied
    pub fn delete_root(&mut self) {
        self.root = None;
    }

    /// Record an event to publish after the writes
    pub fn event(&mut self, warning: bool, reason: &str, action: &str, note: impl Into<String>) {
        self.events.push(TreeEvent {
            warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        });
    }

    /// Events recorded so far
    pub fn events(&self) -> &[TreeEvent] {
        &self.events
    }

    /// The writes turning the snapshot into the current tree
    ///
    /// Creates come first in [`ObjectKind`] order so volumes exist before
    /// their pods, then updates, then deletes in reverse kind order. Root
    /// writes come last.
    pub fn plan(&self) -> Vec<Mutation> {
        let mut creates = Vec::new();
        let mut updates = Vec::new();
        for (key, object) in &self.objects {
            match self.orig_objects.get(key) {
                None => creates.push(Mutation::Create(object.clone())),
                Some(orig) if orig != object => updates.push(Mutation::Update(object.clone())),
                Some(_) => {}
            }
        }
        let deletes = self
            .orig_objects
            .iter()
            .rev()
            .filter(|(key, _)| !self.objects.contains_key(*key))
            .map(|(_, object)| Mutation::Delete(object.clone()));

        let mut plan: Vec<Mutation> = creates.into_iter().chain(updates).chain(deletes).collect();
        plan.extend(self.root_mutations());
        plan
    }

    fn root_mutations(&self) -> Vec<Mutation> {
        let orig = &self.orig_root;
        let Some(root) = &self.root else {
            if !orig.finalizers().iter().any(|f| f == INSTANCE_SET_FINALIZER) {
                return Vec::new();
            }
            let mut released = orig.clone();
            released
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .retain(|f| f != INSTANCE_SET_FINALIZER);
            return vec![Mutation::UpdateRoot(Box::new(released))];
        };

        let mut mutations = Vec::new();
        let meta_changed = root.metadata.labels != orig.metadata.labels
            || root.metadata.annotations != orig.metadata.annotations
            || root.metadata.finalizers != orig.metadata.finalizers;
        if meta_changed || root.spec != orig.spec {
            mutations.push(Mutation::UpdateRoot(Box::new(root.clone())));
        }
        if root.status != orig.status {
            mutations.push(Mutation::RootStatus(Box::new(root.clone())));
        }
        mutations
    }
}
