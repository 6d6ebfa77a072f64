//! Common types for KubeBlocks: CRDs, errors, configuration and utilities

#![deny(missing_docs)]

pub mod config;
pub mod constants;
pub mod crd;
pub mod error;
pub mod events;
pub mod matching;
pub mod quantity;
pub mod telemetry;

use std::collections::BTreeMap;

pub use config::OperatorConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "kubeblocks-operator";

/// Render an exact-match label selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
