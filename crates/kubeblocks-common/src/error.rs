//! Error types for the KubeBlocks operator
//!
//! Errors are structured so that reconcile passes can tell apart three
//! outcomes: real failures (surfaced as status conditions), requeue requests
//! (the pass is still converging) and the fast-stop sentinel (stop running
//! later transformers, not a failure).

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for KubeBlocks operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A definition, topology or version could not be resolved
    #[error("resolution error for {cluster}: {message}")]
    Resolution {
        /// Name of the cluster being resolved
        cluster: String,
        /// Description of what could not be resolved
        message: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.shardings[0].shards")
        field: Option<String>,
    },

    /// Work is waiting for convergence; retry after the given delay
    #[error("requeue after {after:?}: {message}")]
    DelayedRequeue {
        /// Delay before the pass should be retried
        after: Duration,
        /// What the pass is waiting for
        message: String,
    },

    /// Work is waiting for convergence; retry as soon as possible
    #[error("requeue: {message}")]
    Requeue {
        /// What the pass is waiting for
        message: String,
    },

    /// Stop the current pass without running later steps
    #[error("premature stop")]
    PrematureStop,

    /// A referenced object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Name of the missing object
        name: String,
    },

    /// A lifecycle action failed
    #[error("action {action} failed: {message}")]
    Action {
        /// Name of the action (e.g., "shardingPostProvision")
        action: String,
        /// Description of the failure
        message: String,
        /// The action's target pods did not satisfy its precondition
        precondition_failed: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// An invariant the code relies on was broken
    #[error("impossible state: {message}")]
    ImpossibleState {
        /// Description of the broken invariant
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "executor", "controller")
        context: String,
    },
}

impl Error {
    /// Create a resolution error without cluster context
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a resolution error with cluster context
    pub fn resolution_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resolution {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Ask for the pass to be retried after `after`
    pub fn delayed_requeue(after: Duration, msg: impl Into<String>) -> Self {
        Self::DelayedRequeue {
            after,
            message: msg.into(),
        }
    }

    /// Ask for the pass to be retried immediately
    pub fn requeue(msg: impl Into<String>) -> Self {
        Self::Requeue {
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a lifecycle action error
    pub fn action(action: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Action {
            action: action.into(),
            message: msg.into(),
            precondition_failed: false,
        }
    }

    /// Create a lifecycle action error caused by an unmet target precondition
    pub fn action_precondition_failed(action: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Action {
            action: action.into(),
            message: msg.into(),
            precondition_failed: true,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an impossible-state error
    pub fn impossible(msg: impl Into<String>) -> Self {
        Self::ImpossibleState {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for requeue requests (delayed or immediate)
    pub fn is_requeue(&self) -> bool {
        matches!(self, Self::DelayedRequeue { .. } | Self::Requeue { .. })
    }

    /// Delay requested by a requeue error, `Duration::ZERO` for immediate requeue
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::DelayedRequeue { after, .. } => Some(*after),
            Self::Requeue { .. } => Some(Duration::ZERO),
            _ => None,
        }
    }

    /// True for the fast-stop sentinel
    pub fn is_premature_stop(&self) -> bool {
        matches!(self, Self::PrematureStop)
    }

    /// True when a lifecycle action failed only because its targets were not ready
    pub fn is_action_precondition_failed(&self) -> bool {
        matches!(
            self,
            Self::Action {
                precondition_failed: true,
                ..
            }
        )
    }

    /// True for a Kubernetes 404 or our own not-found
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes client errors (4xx other than conflict and throttling) and
    /// spec problems need user intervention; everything else may heal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { source } => match source {
                kube::Error::Api(resp) => {
                    !(400..500).contains(&resp.code) || resp.code == 409 || resp.code == 429
                }
                _ => true,
            },
            Self::Resolution { .. } => false,
            Self::Validation { .. } => false,
            Self::DelayedRequeue { .. } | Self::Requeue { .. } => true,
            Self::PrematureStop => true,
            Self::NotFound { .. } => true,
            Self::Action { .. } => true,
            Self::Serialization { .. } => false,
            Self::ImpossibleState { .. } => false,
            Self::Internal { .. } => true,
        }
    }

    /// Short machine-readable reason used on status conditions
    pub fn condition_reason(&self) -> &'static str {
        match self {
            Self::Kube { .. } => "KubernetesError",
            Self::Resolution { .. } => "ResolutionFailed",
            Self::Validation { .. } => "InvalidSpec",
            Self::DelayedRequeue { .. } | Self::Requeue { .. } => "Requeue",
            Self::PrematureStop => "Stopped",
            Self::NotFound { .. } => "NotFound",
            Self::Action { .. } => "ActionFailed",
            Self::Serialization { .. } => "SerializationFailed",
            Self::ImpossibleState { .. } => "ImpossibleState",
            Self::Internal { .. } => "InternalError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
