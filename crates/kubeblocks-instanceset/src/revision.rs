//! Template revisions and their compact status encoding

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use serde::Serialize;
use sha2::{Digest, Sha256};

use kubeblocks_common::crd::InstanceSetStatus;
use kubeblocks_common::{Error, OperatorConfig, Result};

const COMPRESSED_PREFIX: &str = "zstd:";
const COMPRESSION_LEVEL: i32 = 3;

/// Short hex digest of a value's JSON form
pub(crate) fn hash_json<T: Serialize>(value: &T) -> Result<String> {
    let data = serde_json::to_vec(value)?;
    let hash = Sha256::digest(&data);
    Ok(hash.iter().take(8).map(|b| format!("{:02x}", b)).collect())
}

/// Remove CPU and memory from every container's requests and limits
pub(crate) fn strip_cpu_and_memory(template: &mut PodTemplateSpec) {
    let Some(spec) = template.spec.as_mut() else {
        return;
    };
    let containers = spec
        .containers
        .iter_mut()
        .chain(spec.init_containers.iter_mut().flatten());
    for container in containers {
        let Some(resources) = container.resources.as_mut() else {
            continue;
        };
        for list in [resources.requests.as_mut(), resources.limits.as_mut()]
            .into_iter()
            .flatten()
        {
            list.remove("cpu");
            list.remove("memory");
        }
    }
}

/// Revision of a merged pod template
///
/// Any template change yields a new revision. CPU and memory are left out
/// when the operator is told to ignore vertical scaling.
pub fn build_template_revision(template: &PodTemplateSpec, config: &OperatorConfig) -> Result<String> {
    if config.ignore_pod_vertical_scaling {
        let mut stripped = template.clone();
        strip_cpu_and_memory(&mut stripped);
        return hash_json(&stripped);
    }
    hash_json(template)
}

/// Encode an instance → revision map for status
///
/// Maps above `threshold` entries are returned as a compressed string, in
/// which case the plain map is empty.
pub fn encode_revisions(
    revisions: &BTreeMap<String, String>,
    threshold: usize,
) -> Result<(BTreeMap<String, String>, Option<String>)> {
    if revisions.len() <= threshold {
        return Ok((revisions.clone(), None));
    }
    let json = serde_json::to_vec(revisions)?;
    let compressed = zstd::encode_all(json.as_slice(), COMPRESSION_LEVEL)
        .map_err(|e| Error::serialization(format!("compressing revisions: {}", e)))?;
    Ok((
        BTreeMap::new(),
        Some(format!("{}{}", COMPRESSED_PREFIX, STANDARD.encode(compressed))),
    ))
}

/// Decode a map written by [`encode_revisions`]
pub fn decode_revisions(
    plain: &BTreeMap<String, String>,
    compressed: Option<&str>,
) -> Result<BTreeMap<String, String>> {
    let Some(encoded) = compressed.filter(|c| !c.is_empty()) else {
        return Ok(plain.clone());
    };
    let payload = encoded
        .strip_prefix(COMPRESSED_PREFIX)
        .ok_or_else(|| Error::serialization("compressed revisions lack the zstd prefix"))?;
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| Error::serialization(format!("decoding revisions: {}", e)))?;
    let json = zstd::decode_all(bytes.as_slice())
        .map_err(|e| Error::serialization(format!("decompressing revisions: {}", e)))?;
    Ok(serde_json::from_slice(&json)?)
}

/// Desired revisions recorded in status
pub fn update_revisions(status: &InstanceSetStatus) -> Result<BTreeMap<String, String>> {
    decode_revisions(
        &status.update_revisions,
        status.compressed_update_revisions.as_deref(),
    )
}

/// Revisions recorded in status before the update in progress
pub fn current_revisions(status: &InstanceSetStatus) -> Result<BTreeMap<String, String>> {
    decode_revisions(
        &status.current_revisions,
        status.compressed_current_revisions.as_deref(),
    )
}

/// Record desired revisions in status
pub fn set_update_revisions(
    status: &mut InstanceSetStatus,
    revisions: &BTreeMap<String, String>,
    threshold: usize,
) -> Result<()> {
    let (plain, compressed) = encode_revisions(revisions, threshold)?;
    status.update_revisions = plain;
    status.compressed_update_revisions = compressed;
    Ok(())
}

/// Promote the desired revisions to current
pub fn promote_update_revisions(status: &mut InstanceSetStatus) {
    status.current_revisions = status.update_revisions.clone();
    status.compressed_current_revisions = status.compressed_update_revisions.clone();
}
