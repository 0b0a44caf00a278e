//! Stage fingerprints: the unit of staleness comparison.
//!
//! A fingerprint hashes everything that can invalidate a stage: its command
//! text, each dependency's content hash, each referenced parameter's current
//! value, and the declared output and metric paths. The hash is taken over a
//! canonical JSON document so it is stable across runs and platforms.

use cairn_hash::sha256_bytes;
use cairn_types::Result;

use crate::definition::StageDef;

/// Compute a stage's fingerprint from its definition plus live inputs.
///
/// `dep_hashes` and `param_values` must be in declaration order; the
/// document's top-level keys are emitted in sorted order by serde_json, so
/// the bytes are canonical.
pub fn stage_fingerprint(
    stage: &StageDef,
    dep_hashes: &[(String, String)],
    param_values: &[(String, serde_json::Value)],
) -> Result<String> {
    let doc = serde_json::json!({
        "cmd": stage.cmd,
        "deps": dep_hashes,
        "metrics": stage.metrics,
        "outs": stage.outs,
        "params": param_values,
    });
    Ok(sha256_bytes(&serde_json::to_vec(&doc)?))
}
