//! Operator configuration
//!
//! Feature switches are read from flags or the environment once at startup
//! and handed to the controllers through their context. Reconcile code takes
//! `&OperatorConfig` and never looks at the process environment itself.

use std::time::Duration;

use clap::{Args, ValueEnum};

/// How the operator decides whether pods can be resized in place
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum VerticalScalingMode {
    /// Detect from the API server version
    #[default]
    Auto,
    /// Always assume in-place resize works
    Enabled,
    /// Never resize in place
    Disabled,
}

/// Resolved in-place vertical scaling support
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VerticalScalingSupport {
    /// CPU/memory changes can be applied to a running pod
    Supported,
    /// CPU/memory changes require recreating the pod
    #[default]
    Unsupported,
}

impl VerticalScalingSupport {
    /// True if in-place resize is available
    pub fn is_supported(self) -> bool {
        self == Self::Supported
    }
}

impl VerticalScalingMode {
    /// Resolve the mode against the API server's `major.minor` version
    ///
    /// In-place pod resize is available from Kubernetes 1.29.
    pub fn resolve(self, major: &str, minor: &str) -> VerticalScalingSupport {
        match self {
            Self::Enabled => VerticalScalingSupport::Supported,
            Self::Disabled => VerticalScalingSupport::Unsupported,
            Self::Auto => {
                let major: u32 = major.trim().parse().unwrap_or(0);
                let minor: u32 = minor
                    .trim()
                    .trim_end_matches(|c: char| !c.is_ascii_digit())
                    .parse()
                    .unwrap_or(0);
                if major > 1 || (major == 1 && minor >= 29) {
                    VerticalScalingSupport::Supported
                } else {
                    VerticalScalingSupport::Unsupported
                }
            }
        }
    }
}

/// Command-line and environment configuration for the operator
#[derive(Args, Clone, Debug)]
pub struct OperatorArgs {
    /// Ignore CPU/memory changes when deciding whether pods need updating
    #[arg(long, env = "IGNORE_POD_VERTICAL_SCALING", default_value_t = false)]
    pub ignore_pod_vertical_scaling: bool,

    /// In-place pod vertical scaling: auto, enabled or disabled
    #[arg(long, env = "IN_PLACE_POD_VERTICAL_SCALING", value_enum, default_value_t = VerticalScalingMode::Auto)]
    pub in_place_vertical_scaling: VerticalScalingMode,

    /// Store instance revisions compressed once there are more than this many
    #[arg(long, env = "REVISION_COMPRESSION_THRESHOLD", default_value_t = 16)]
    pub revision_compression_threshold: usize,

    /// Also emit legacy ReplicatedStateMachine labels on pods
    #[arg(long, env = "RSM_COMPATIBILITY_MODE", default_value_t = false)]
    pub rsm_compatibility_mode: bool,

    /// Seconds to wait before retrying a failed reconcile
    #[arg(long, env = "REQUEUE_AFTER_ERROR_SECS", default_value_t = 30)]
    pub requeue_after_error_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value_t = true, action = clap::ArgAction::Set)]
    pub log_json: bool,
}

/// Configuration shared by every controller, resolved once at startup
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// CPU/memory differences are ignored for revisions and in-place updates
    pub ignore_pod_vertical_scaling: bool,
    /// Whether the cluster can resize running pods
    pub vertical_scaling: VerticalScalingSupport,
    /// Revision map size above which it is stored compressed
    pub revision_compression_threshold: usize,
    /// Emit legacy labels on built pods
    pub rsm_compatibility_mode: bool,
    /// Backoff after a failed reconcile
    pub requeue_after_error: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            ignore_pod_vertical_scaling: false,
            vertical_scaling: VerticalScalingSupport::Unsupported,
            revision_compression_threshold: 16,
            rsm_compatibility_mode: false,
            requeue_after_error: Duration::from_secs(30),
        }
    }
}

impl OperatorConfig {
    /// Build the runtime config from parsed args and the API server version
    pub fn from_args(args: &OperatorArgs, server_major: &str, server_minor: &str) -> Self {
        Self {
            ignore_pod_vertical_scaling: args.ignore_pod_vertical_scaling,
            vertical_scaling: args
                .in_place_vertical_scaling
                .resolve(server_major, server_minor),
            revision_compression_threshold: args.revision_compression_threshold,
            rsm_compatibility_mode: args.rsm_compatibility_mode,
            requeue_after_error: Duration::from_secs(args.requeue_after_error_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_mode_detects_supported_versions() {
        let mode = VerticalScalingMode::Auto;
        assert_eq!(mode.resolve("1", "29"), VerticalScalingSupport::Supported);
        assert_eq!(mode.resolve("1", "30+"), VerticalScalingSupport::Supported);
        assert_eq!(mode.resolve("1", "28"), VerticalScalingSupport::Unsupported);
        assert_eq!(mode.resolve("", ""), VerticalScalingSupport::Unsupported);
    }

    #[test]
    fn test_explicit_modes_ignore_version() {
        assert!(VerticalScalingMode::Enabled.resolve("1", "20").is_supported());
        assert!(!VerticalScalingMode::Disabled.resolve("1", "31").is_supported());
    }

    #[test]
    fn test_from_args() {
        let args = OperatorArgs {
            ignore_pod_vertical_scaling: true,
            in_place_vertical_scaling: VerticalScalingMode::Auto,
            revision_compression_threshold: 4,
            rsm_compatibility_mode: true,
            requeue_after_error_secs: 5,
            log_json: false,
        };
        let config = OperatorConfig::from_args(&args, "1", "30");
        assert!(config.ignore_pod_vertical_scaling);
        assert!(config.vertical_scaling.is_supported());
        assert_eq!(config.revision_compression_threshold, 4);
        assert_eq!(config.requeue_after_error, Duration::from_secs(5));
    }
}
