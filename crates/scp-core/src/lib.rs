#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-core
//!
//! Shared data model for the Semantic Compiler Platform: the signed
//! capability catalog, the node capability profile, the LLM-IR
//! instruction set, execution slices, sync points, audit events, and the
//! project version lifecycle. Every other `scp-*` crate depends on this
//! one for its wire types.

/// Audit event data model and hash-chain primitives.
pub mod audit;
/// Signed, versioned capability catalog entries.
pub mod capability;
/// Configuration loaded from the environment, threaded through constructors.
pub mod config;
/// Comprehensive error taxonomy for the platform.
pub mod error;
/// LLM-IR instruction set, opcodes, and resolved-IR types.
pub mod ir;
/// Heterogeneous node capability profile.
pub mod node;
/// Execution slices, sync points, and cross-node data flows.
pub mod slice;
/// Project version lifecycle state machine.
pub mod version;

/// Current wire contract version embedded in compiled workflows and slice
/// payloads.
///
/// # Examples
///
/// ```
/// assert_eq!(scp_core::CONTRACT_VERSION, "scp/v1");
/// ```
pub const CONTRACT_VERSION: &str = "scp/v1";

/// Serialize `value` to canonical JSON: keys sorted, no insignificant
/// whitespace. Used everywhere a byte-stable digest is required (catalog
/// signatures, audit event hashing, slice checksums, compiled-workflow
/// checksums).
///
/// # Errors
///
/// Returns an error if `value` cannot be serialized to JSON.
pub fn canonical_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let raw = serde_json::to_value(value)?;
    let sorted = sort_json_keys(raw);
    serde_json::to_vec(&sorted)
}

fn sort_json_keys(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_json_keys(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_json_keys).collect()),
        other => other,
    }
}

/// SHA-256 digest of `bytes`, hex-encoded.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// The genesis `previousEventHash` for an empty audit chain: 64 zero hex
/// characters.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
