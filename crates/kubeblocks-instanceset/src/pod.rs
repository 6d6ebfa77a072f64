//! Pod state predicates

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Pod, PodCondition};

use kubeblocks_common::constants::{REVISION_LABEL, ROLE_LABEL};

const PHASE_RUNNING: &str = "Running";
const PHASE_PENDING: &str = "Pending";
const PHASE_FAILED: &str = "Failed";

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

fn ready_condition(pod: &Pod) -> Option<&PodCondition> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready")
}

/// Acknowledged by the API server: it has a phase
pub fn is_created(pod: &Pod) -> bool {
    !phase(pod).is_empty()
}

/// Running with a true Ready condition
pub fn is_ready(pod: &Pod) -> bool {
    phase(pod) == PHASE_RUNNING && ready_condition(pod).is_some_and(|c| c.status == "True")
}

/// Ready for at least `min_ready_seconds` at `now`
pub fn is_available(pod: &Pod, min_ready_seconds: i32, now: DateTime<Utc>) -> bool {
    if !is_ready(pod) {
        return false;
    }
    if min_ready_seconds <= 0 {
        return true;
    }
    ready_condition(pod)
        .and_then(|c| c.last_transition_time.as_ref())
        .is_some_and(|t| t.0 + Duration::seconds(i64::from(min_ready_seconds)) <= now)
}

/// Has a deletion timestamp
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Ready and not terminating
pub fn is_healthy(pod: &Pod) -> bool {
    is_ready(pod) && !is_terminating(pod)
}

/// Not yet scheduled or started
pub fn is_pending(pod: &Pod) -> bool {
    phase(pod) == PHASE_PENDING
}

/// Failed phase, a container that exited non-zero, or one in crash-loop backoff
pub fn is_failed(pod: &Pod) -> bool {
    if phase(pod) == PHASE_FAILED {
        return true;
    }
    let Some(statuses) = pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) else {
        return false;
    };
    statuses.iter().any(|cs| {
        let Some(state) = cs.state.as_ref() else {
            return false;
        };
        state.terminated.as_ref().is_some_and(|t| t.exit_code != 0)
            || state
                .waiting
                .as_ref()
                .and_then(|w| w.reason.as_deref())
                .is_some_and(|r| r == "CrashLoopBackOff")
    })
}

/// Revision label, empty if unset
pub fn revision(pod: &Pod) -> &str {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(REVISION_LABEL))
        .map(String::as_str)
        .unwrap_or_default()
}

/// Role label in lower case, empty if unset
pub fn role(pod: &Pod) -> String {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(ROLE_LABEL))
        .map(|r| r.to_lowercase())
        .unwrap_or_default()
}
