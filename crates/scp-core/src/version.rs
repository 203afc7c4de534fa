// Project version lifecycle: immutability, lineage, and atomic
// promotion. State machine logic (transition legality, atomic promotion)
// lives in `scp-version`; this module defines the shape and the pure
// transition-legality check every consumer needs.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`ProjectVersion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum VersionStatus {
    /// Freshly created, not yet submitted for validation.
    Draft,
    /// Submitted; compilation/validation is running.
    Validating,
    /// Validation succeeded; eligible for promotion.
    Valid,
    /// The currently promoted version for its project.
    Active,
    /// Promoted and currently executing a workflow run.
    Executing,
    /// Terminal: superseded or explicitly retired.
    Archived,
}

impl VersionStatus {
    /// `true` if transitioning from `self` to `next` is a legal edge in
    /// the state machine of spec.md §4.6.
    #[must_use]
    pub fn can_transition_to(self, next: VersionStatus) -> bool {
        use VersionStatus::{Active, Archived, Draft, Executing, Valid, Validating};
        match (self, next) {
            (Archived, _) => false,
            (_, Archived) => true,
            (Draft, Validating) => true,
            (Validating, Valid) => true,
            (Validating, Draft) => true,
            (Valid, Active) => true,
            (Active, Executing) => true,
            (Executing, Active) => true,
            _ => false,
        }
    }
}

/// A versioned, immutable snapshot of compiled IR for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProjectVersion {
    /// Unique version record id.
    pub id: String,
    /// The owning project.
    pub project_id: String,
    /// Monotonically increasing version number within the project.
    pub version: u64,
    /// The version this one was forked from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version: Option<u64>,
    /// Current lifecycle status.
    pub status: VersionStatus,
    /// Serialized compiled IR bytes.
    pub ir_binary: Vec<u8>,
    /// `SHA256(ir_binary)`, recomputed on every submission.
    pub ir_checksum: String,
    /// Who validated this version, once validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_by: Option<String>,
    /// When this version was validated, once validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<DateTime<Utc>>,
    /// Human-supplied reason for this version's changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_reason: Option<String>,
    /// When this version record was created.
    pub created_at: DateTime<Utc>,
    /// When this version was archived, once archived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl ProjectVersion {
    /// Recompute `SHA256(ir_binary)` and compare to `self.ir_checksum`.
    /// A mismatch means the IR was tampered with after the checksum was
    /// recorded — always an [`crate::error::ScpError::Integrity`] for
    /// callers.
    #[must_use]
    pub fn checksum_matches(&self) -> bool {
        crate::sha256_hex(&self.ir_binary) == self.ir_checksum
    }
}
