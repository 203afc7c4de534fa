// Audit event data model and the pure hash-chain primitives. The
// stateful appender and chain-wide verifier live in `scp-audit`; this
// module only defines the shape and the hash computation every consumer
// needs to check a single event without depending on the appender.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::GENESIS_HASH;

/// Outcome of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    /// The step completed successfully.
    Success,
    /// The step failed.
    Failed,
    /// The step completed with a non-fatal warning.
    Warning,
    /// A fallback path was taken (e.g. `USE_DEFAULT` at a sync point).
    Failover,
}

/// One entry in the tamper-evident audit chain.
///
/// `self_hash` is `SHA256(canonical_json(payload ∪ {previousEventHash}))`
/// where `payload` is this struct with `self_hash` itself excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AuditEvent {
    /// Unique event id.
    pub id: String,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// The user who initiated the owning workflow run, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// The workflow this event belongs to.
    pub workflow_id: String,
    /// The instruction index this event concerns.
    pub instruction_index: usize,
    /// Free-form event type (e.g. `"opcode_dispatch"`, `"sync_point"`).
    pub event_type: String,
    /// The action performed (e.g. the opcode name, or `"dispatch"`).
    pub action: String,
    /// Outcome of the action.
    pub result: AuditResult,
    /// Wall-clock duration of the action in milliseconds.
    pub duration_ms: u64,
    /// `self_hash` of the immediately prior event for this workflow, or
    /// [`GENESIS_HASH`] for the first event.
    pub previous_event_hash: String,
    /// This event's own hash, computed over everything above plus
    /// `previous_event_hash`.
    pub self_hash: String,
}

/// Fields hashed to produce an [`AuditEvent::self_hash`]: everything in
/// the event except `self_hash` itself.
#[derive(Serialize)]
struct HashedPayload<'a> {
    id: &'a str,
    timestamp: DateTime<Utc>,
    user_id: &'a Option<String>,
    workflow_id: &'a str,
    instruction_index: usize,
    event_type: &'a str,
    action: &'a str,
    result: AuditResult,
    duration_ms: u64,
    previous_event_hash: &'a str,
}

/// Compute the `self_hash` of an event given its fields and the
/// `previous_event_hash` it will carry.
#[must_use]
pub fn compute_self_hash(
    id: &str,
    timestamp: DateTime<Utc>,
    user_id: &Option<String>,
    workflow_id: &str,
    instruction_index: usize,
    event_type: &str,
    action: &str,
    result: AuditResult,
    duration_ms: u64,
    previous_event_hash: &str,
) -> String {
    let payload = HashedPayload {
        id,
        timestamp,
        user_id,
        workflow_id,
        instruction_index,
        event_type,
        action,
        result,
        duration_ms,
        previous_event_hash,
    };
    let bytes = crate::canonical_json(&payload).unwrap_or_default();
    crate::sha256_hex(&bytes)
}

impl AuditEvent {
    /// Construct a new event, computing its own `self_hash`. Pass
    /// [`GENESIS_HASH`] as `previous_event_hash` for the first event in a
    /// workflow.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        timestamp: DateTime<Utc>,
        user_id: Option<String>,
        workflow_id: String,
        instruction_index: usize,
        event_type: String,
        action: String,
        result: AuditResult,
        duration_ms: u64,
        previous_event_hash: String,
    ) -> Self {
        let self_hash = compute_self_hash(
            &id,
            timestamp,
            &user_id,
            &workflow_id,
            instruction_index,
            &event_type,
            &action,
            result,
            duration_ms,
            &previous_event_hash,
        );
        Self {
            id,
            timestamp,
            user_id,
            workflow_id,
            instruction_index,
            event_type,
            action,
            result,
            duration_ms,
            previous_event_hash,
            self_hash,
        }
    }

    /// Recompute this event's hash and compare it to the stored value.
    #[must_use]
    pub fn verify_self_hash(&self) -> bool {
        let recomputed = compute_self_hash(
            &self.id,
            self.timestamp,
            &self.user_id,
            &self.workflow_id,
            self.instruction_index,
            &self.event_type,
            &self.action,
            self.result,
            self.duration_ms,
            &self.previous_event_hash,
        );
        recomputed == self.self_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn new_event_verifies() {
        let event = AuditEvent::new(
            "e1".into(),
            ts(),
            None,
            "wf-1".into(),
            0,
            "opcode_dispatch".into(),
            "TRIGGER".into(),
            AuditResult::Success,
            5,
            GENESIS_HASH.to_string(),
        );
        assert!(event.verify_self_hash());
        assert_eq!(event.previous_event_hash, GENESIS_HASH);
    }

    #[test]
    fn tampering_breaks_verification() {
        let mut event = AuditEvent::new(
            "e1".into(),
            ts(),
            None,
            "wf-1".into(),
            0,
            "opcode_dispatch".into(),
            "TRIGGER".into(),
            AuditResult::Success,
            5,
            GENESIS_HASH.to_string(),
        );
        assert!(event.verify_self_hash());
        event.duration_ms += 1;
        assert!(!event.verify_self_hash());
    }

    #[test]
    fn chained_event_references_prior_self_hash() {
        let first = AuditEvent::new(
            "e1".into(),
            ts(),
            None,
            "wf-1".into(),
            0,
            "opcode_dispatch".into(),
            "TRIGGER".into(),
            AuditResult::Success,
            5,
            GENESIS_HASH.to_string(),
        );
        let second = AuditEvent::new(
            "e2".into(),
            ts(),
            None,
            "wf-1".into(),
            1,
            "opcode_dispatch".into(),
            "TRANSFORM".into(),
            AuditResult::Success,
            3,
            first.self_hash.clone(),
        );
        assert_eq!(second.previous_event_hash, first.self_hash);
        assert!(second.verify_self_hash());
    }
}
