//! Kubernetes Events emitted by the cluster and InstanceSet controllers
//!
//! Publishing never fails a reconcile. A rejected event is logged and
//! dropped.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for events about a reconciled object
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event about `resource_ref`
    ///
    /// `reason` is one of [`reasons`], `action` one of [`actions`].
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the kube event [`Recorder`]
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Events are reported as `controller_name`, instance `$POD_NAME` when set
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "event dropped"
            );
        }
    }
}

/// Publisher that discards everything
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// A published event captured in memory
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// True for Warning events
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event message
    pub note: Option<String>,
}

/// Publisher that keeps events in memory, for assertions in tests
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Snapshot of events published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// True if an event with `reason` was published
    pub fn has_reason(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.reason == reason)
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
        }
    }
}

/// Event reasons
pub mod reasons {
    // Cluster
    /// Topology resolved, components are being provisioned
    pub const PROVISIONING_STARTED: &str = "ProvisioningStarted";
    /// Some components or shardings are not running yet
    pub const COMPONENTS_NOT_READY: &str = "ComponentsNotReady";
    /// All components are running
    pub const CLUSTER_READY: &str = "ClusterReady";
    /// Some components or shardings failed
    pub const CLUSTER_FAILED: &str = "ClusterFailed";
    /// Deletion refused by the DoNotTerminate policy
    pub const DELETION_BLOCKED: &str = "DeletionBlocked";
    /// Cluster deletion initiated
    pub const DELETION_STARTED: &str = "DeletionStarted";
    /// A sharding lifecycle action failed
    pub const SHARDING_ACTION_FAILED: &str = "ShardingActionFailed";

    // InstanceSet
    /// Spec validation failed
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// An unhealthy pod is being removed by scale-in
    pub const UNHEALTHY_SCALE_IN: &str = "UnhealthyScaleIn";
    /// A pod needs recreation but the update policy only allows in-place updates
    pub const STRICT_IN_PLACE: &str = "StrictInPlace";
}

/// Event actions
pub mod actions {
    /// Regular reconciliation
    pub const RECONCILE: &str = "Reconcile";
    /// Deleting resources
    pub const DELETE: &str = "Delete";
    /// Scaling instances in or out
    pub const SCALE: &str = "Scale";
    /// Updating instances
    pub const UPDATE: &str = "Update";
}
