// Capability catalog data model: entries, signatures, and the derived
// catalog document. Signing/search logic lives in `scp-catalog`; this
// module only defines the shapes and the pure signature primitive every
// consumer needs to verify a signature without pulling in the registry.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Broad classification of an executable primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    /// A connector to an external system (database, SaaS API, bus).
    Connector,
    /// A hosted service invocation.
    Service,
    /// A local action (file write, state mutation).
    Action,
    /// A pure data transform.
    Transform,
}

/// A subset-of-JSON-Schema type descriptor for a capability's input or
/// output field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TypedField {
    /// Field name.
    pub name: String,
    /// JSON Schema `type` keyword value (`"string"`, `"number"`, …).
    #[serde(rename = "type")]
    pub schema_type: String,
    /// Whether the field must be present.
    #[serde(default)]
    pub required: bool,
}

/// Where and how a capability is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorRef {
    /// An in-process function reference, addressed by name.
    FunctionRef {
        /// Registered function name.
        name: String,
    },
    /// An HTTP endpoint.
    Http {
        /// Fully qualified URL template.
        url: String,
        /// HTTP method.
        #[serde(default = "default_http_method")]
        method: String,
    },
    /// A gRPC method.
    Grpc {
        /// `package.Service/Method` path.
        method: String,
    },
    /// A WebSocket channel.
    WebSocket {
        /// Channel URL.
        url: String,
    },
}

fn default_http_method() -> String {
    "POST".to_string()
}

/// Estimated resource cost of invoking a capability, used by the
/// distribution planner's admission checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EstimatedCost {
    /// Fractional CPU share in `[0, 1]`.
    pub cpu: f64,
    /// Estimated memory footprint in megabytes.
    pub memory_mb: f64,
}

impl EstimatedCost {
    /// Construct a cost, clamping `cpu` into `[0, 1]` and `memory_mb` to
    /// be non-negative.
    #[must_use]
    pub fn new(cpu: f64, memory_mb: f64) -> Self {
        Self {
            cpu: cpu.clamp(0.0, 1.0),
            memory_mb: memory_mb.max(0.0),
        }
    }
}

/// Performance and scheduling hints attached to a capability entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PerformanceHints {
    /// Expected wall-clock duration in milliseconds.
    pub estimated_duration_ms: u64,
    /// Whether results may be cached by input hash.
    pub cacheable: bool,
    /// Cache time-to-live in seconds, meaningful only when `cacheable`.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    /// Whether concurrent invocations are safe.
    pub supports_parallel: bool,
    /// Whether this capability invokes an LLM (routes to central + vault + internet).
    pub is_llm_call: bool,
    /// Estimated resource cost.
    pub estimated_cost: EstimatedCost,
}

/// A cryptographic signature over a capability entry's identity fields.
///
/// Bound to `id|name|category|description|signedAt`, recomputed by
/// concatenating those fields with `|` and HMAC-SHA256'ing the result
/// with the catalog signing secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CryptoSignature {
    /// Signing algorithm identifier. Always `"HMAC-SHA256"` in this
    /// implementation.
    pub algorithm: String,
    /// Identifier of the key used to sign, derived from the secret.
    pub key_id: String,
    /// RFC 3339 timestamp at which the signature was produced.
    pub signed_at: String,
    /// Hex-encoded HMAC digest.
    pub hex_digest: String,
}

/// Compute the signing payload for a capability entry: its identity
/// fields joined with `|`.
#[must_use]
pub fn signing_payload(id: &str, name: &str, category: CapabilityCategory, description: &str, signed_at: &str) -> String {
    let category_str = serde_json::to_value(category)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    format!("{id}|{name}|{category_str}|{description}|{signed_at}")
}

/// Derive the 8-hex-character key id for a signing secret: the first 8
/// hex characters of `HMAC(secret, "keyid")`.
#[must_use]
pub fn derive_key_id(secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(b"keyid");
    let digest = hex::encode(mac.finalize().into_bytes());
    digest[..8].to_string()
}

/// Sign a payload with `secret`, returning the hex-encoded digest.
#[must_use]
pub fn hmac_hex(secret: &[u8], payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// One executable primitive in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityEntry {
    /// Stable, unique identifier (e.g. `"slack.post"`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Broad classification.
    pub category: CapabilityCategory,
    /// Human-readable description, part of the signed payload.
    pub description: String,
    /// Typed input fields.
    pub inputs: Vec<TypedField>,
    /// Typed output fields.
    pub outputs: Vec<TypedField>,
    /// Where this capability is invoked.
    pub executor: ExecutorRef,
    /// Performance and scheduling hints.
    pub performance: PerformanceHints,
    /// The signature binding this entry's identity.
    pub signature: CryptoSignature,
}

impl CapabilityEntry {
    /// Recompute the HMAC over this entry's identity fields and compare
    /// against `self.signature.hex_digest`.
    #[must_use]
    pub fn verify_signature(&self, secret: &[u8]) -> bool {
        let payload = signing_payload(
            &self.id,
            &self.name,
            self.category,
            &self.description,
            &self.signature.signed_at,
        );
        let expected = hmac_hex(secret, &payload);
        expected == self.signature.hex_digest
    }
}

/// A versioned, timestamped snapshot of all catalog entries plus a
/// derived search index.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CatalogDocument {
    /// Monotonically increasing document version.
    pub version: u64,
    /// RFC 3339 build timestamp.
    pub built_at: String,
    /// All entries in the snapshot, keyed by id for O(1) lookup.
    pub entries: BTreeMap<String, CapabilityEntry>,
}

impl CatalogDocument {
    /// Look up an entry by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&CapabilityEntry> {
        self.entries.get(id)
    }

    /// All entries of a given category, in id order.
    #[must_use]
    pub fn by_category(&self, category: CapabilityCategory) -> Vec<&CapabilityEntry> {
        self.entries
            .values()
            .filter(|e| e.category == category)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(secret: &[u8]) -> CapabilityEntry {
        let signed_at = "2026-01-01T00:00:00Z".to_string();
        let payload = signing_payload(
            "slack.post",
            "Slack Post",
            CapabilityCategory::Service,
            "Post a message to Slack",
            &signed_at,
        );
        CapabilityEntry {
            id: "slack.post".into(),
            name: "Slack Post".into(),
            category: CapabilityCategory::Service,
            description: "Post a message to Slack".into(),
            inputs: vec![],
            outputs: vec![],
            executor: ExecutorRef::Http {
                url: "https://slack.example/post".into(),
                method: "POST".into(),
            },
            performance: PerformanceHints {
                estimated_duration_ms: 200,
                cacheable: false,
                cache_ttl_secs: None,
                supports_parallel: true,
                is_llm_call: false,
                estimated_cost: EstimatedCost::new(0.1, 16.0),
            },
            signature: CryptoSignature {
                algorithm: "HMAC-SHA256".into(),
                key_id: derive_key_id(secret),
                signed_at,
                hex_digest: hmac_hex(secret, &payload),
            },
        }
    }

    #[test]
    fn verify_accepts_correctly_signed_entry() {
        let secret = b"catalog-secret";
        let entry = sample_entry(secret);
        assert!(entry.verify_signature(secret));
    }

    #[test]
    fn verify_rejects_bit_flip_in_identity_fields() {
        let secret = b"catalog-secret";
        let mut entry = sample_entry(secret);
        entry.description.push('!');
        assert!(!entry.verify_signature(secret));

        let mut entry = sample_entry(secret);
        entry.name = "Slack Posts".into();
        assert!(!entry.verify_signature(secret));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let entry = sample_entry(b"catalog-secret");
        assert!(!entry.verify_signature(b"other-secret"));
    }

    #[test]
    fn key_id_is_stable_and_eight_hex_chars() {
        let a = derive_key_id(b"secret");
        let b = derive_key_id(b"secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn estimated_cost_clamps() {
        let cost = EstimatedCost::new(5.0, -3.0);
        assert_eq!(cost.cpu, 1.0);
        assert_eq!(cost.memory_mb, 0.0);
    }
}
