#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-audit
//!
//! The stateful audit chain appender and verifier (component C11,
//! spec.md §4.10). [`scp_core::audit`] defines the event shape and the
//! pure hash computation; this crate owns the append-only store, the
//! monotonic-timestamp and hash-link enforcement, the single-writer-per-
//! workflow invariant, and chain replay verification.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use scp_core::audit::{AuditEvent, AuditResult};
use scp_core::GENESIS_HASH;
use thiserror::Error;

/// Errors raised by chain append and writer registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// Another writer already holds the append lock for this workflow.
    #[error("workflow {0} already has a registered audit writer")]
    WriterAlreadyRegistered(String),
    /// An append was attempted with a timestamp not strictly after the
    /// chain's last event for this workflow.
    #[error("non-monotonic timestamp for workflow {workflow_id}: previous {previous}, attempted {attempted}")]
    NonMonotonicTimestamp {
        /// The workflow whose chain was violated.
        workflow_id: String,
        /// The previous event's timestamp.
        previous: DateTime<Utc>,
        /// The timestamp that was rejected.
        attempted: DateTime<Utc>,
    },
}

/// Result of replaying and verifying one workflow's chain (spec.md §6
/// `verifyChain`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// The workflow verified.
    pub workflow_id: String,
    /// Total events in the chain.
    pub total_events: usize,
    /// `true` if every hash and link recomputes cleanly.
    pub verified: bool,
    /// Index of the first event whose hash or link failed to recompute.
    pub first_broken_at: Option<usize>,
    /// Human-readable detail on the first break, if any.
    pub error_details: Option<String>,
}

/// Append-only, hash-linked store of [`AuditEvent`]s, one chain per
/// workflow.
#[derive(Default, Debug)]
pub struct AuditChain {
    events: RwLock<BTreeMap<String, Vec<AuditEvent>>>,
    writers: RwLock<BTreeSet<String>>,
}

/// Proof that the holder is the sole registered appender for one
/// workflow's chain. Dropping the handle releases the registration.
#[derive(Debug)]
pub struct AuditWriterHandle {
    chain: Arc<AuditChain>,
    workflow_id: String,
}

impl Drop for AuditWriterHandle {
    fn drop(&mut self) {
        self.chain.writers.write().expect("writers lock poisoned").remove(&self.workflow_id);
    }
}

impl AuditChain {
    /// An empty chain store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register as the sole appender for `workflow_id`. Fails if another
    /// handle for the same workflow is still live (spec.md §5: "the
    /// audit chain is appended by exactly one writer per workflow").
    pub fn register_writer(self: &Arc<Self>, workflow_id: &str) -> Result<AuditWriterHandle, AuditError> {
        let mut writers = self.writers.write().expect("writers lock poisoned");
        if !writers.insert(workflow_id.to_string()) {
            return Err(AuditError::WriterAlreadyRegistered(workflow_id.to_string()));
        }
        Ok(AuditWriterHandle {
            chain: Arc::clone(self),
            workflow_id: workflow_id.to_string(),
        })
    }

    /// Append one event, chained onto the prior event for this workflow
    /// (or genesis). `writer` proves single-writer ownership; its
    /// `workflow_id` must match `event`'s.
    ///
    /// # Panics
    ///
    /// Panics if `writer` was registered for a different workflow than
    /// the one being appended to, which indicates a caller bug.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        writer: &AuditWriterHandle,
        id: String,
        timestamp: DateTime<Utc>,
        user_id: Option<String>,
        workflow_id: &str,
        instruction_index: usize,
        event_type: String,
        action: String,
        result: AuditResult,
        duration_ms: u64,
    ) -> Result<AuditEvent, AuditError> {
        assert_eq!(writer.workflow_id, workflow_id, "writer handle registered for a different workflow");

        let mut events = self.events.write().expect("events lock poisoned");
        let chain = events.entry(workflow_id.to_string()).or_default();

        let previous_event_hash = match chain.last() {
            Some(last) => {
                if timestamp <= last.timestamp {
                    return Err(AuditError::NonMonotonicTimestamp {
                        workflow_id: workflow_id.to_string(),
                        previous: last.timestamp,
                        attempted: timestamp,
                    });
                }
                last.self_hash.clone()
            }
            None => GENESIS_HASH.to_string(),
        };

        let event = AuditEvent::new(
            id,
            timestamp,
            user_id,
            workflow_id.to_string(),
            instruction_index,
            event_type,
            action,
            result,
            duration_ms,
            previous_event_hash,
        );
        chain.push(event.clone());
        tracing::info!(workflow_id, instruction_index, result = ?result, "audit event appended");
        Ok(event)
    }

    /// All events recorded for `workflow_id`, in append order.
    #[must_use]
    pub fn events_for(&self, workflow_id: &str) -> Vec<AuditEvent> {
        self.events.read().expect("events lock poisoned").get(workflow_id).cloned().unwrap_or_default()
    }

    /// Replay `workflow_id`'s chain, recomputing every `self_hash` and
    /// every `previous_event_hash` link, reporting the first break.
    #[must_use]
    pub fn verify_chain(&self, workflow_id: &str) -> ChainVerification {
        let events = self.events_for(workflow_id);
        let total_events = events.len();

        let mut expected_previous = GENESIS_HASH.to_string();
        for (index, event) in events.iter().enumerate() {
            if event.previous_event_hash != expected_previous {
                return ChainVerification {
                    workflow_id: workflow_id.to_string(),
                    total_events,
                    verified: false,
                    first_broken_at: Some(index),
                    error_details: Some(format!(
                        "event {index} previous_event_hash {} does not match expected {expected_previous}",
                        event.previous_event_hash
                    )),
                };
            }
            if !event.verify_self_hash() {
                return ChainVerification {
                    workflow_id: workflow_id.to_string(),
                    total_events,
                    verified: false,
                    first_broken_at: Some(index),
                    error_details: Some(format!("event {index} self_hash does not match its recomputed payload hash")),
                };
            }
            expected_previous = event.self_hash.clone();
        }

        ChainVerification {
            workflow_id: workflow_id.to_string(),
            total_events,
            verified: true,
            first_broken_at: None,
            error_details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs)
    }

    fn append(chain: &Arc<AuditChain>, writer: &AuditWriterHandle, seq: usize, offset_secs: i64) -> AuditEvent {
        chain
            .append(
                writer,
                format!("e{seq}"),
                ts(offset_secs),
                None,
                "wf-1",
                seq,
                "opcode_dispatch".into(),
                "TRANSFORM".into(),
                AuditResult::Success,
                5,
            )
            .unwrap()
    }

    #[test]
    fn genesis_event_links_to_64_zeros() {
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let first = append(&chain, &writer, 0, 0);
        assert_eq!(first.previous_event_hash, GENESIS_HASH);
    }

    #[test]
    fn chained_events_verify() {
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        for i in 0..5 {
            append(&chain, &writer, i, i as i64);
        }
        let report = chain.verify_chain("wf-1");
        assert!(report.verified);
        assert_eq!(report.total_events, 5);
        assert_eq!(report.first_broken_at, None);
    }

    #[test]
    fn tampering_is_caught_at_its_index() {
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        for i in 0..4 {
            append(&chain, &writer, i, i as i64);
        }
        {
            let mut events = chain.events.write().unwrap();
            let wf_events = events.get_mut("wf-1").unwrap();
            wf_events[2].duration_ms += 1;
        }
        let report = chain.verify_chain("wf-1");
        assert!(!report.verified);
        assert_eq!(report.first_broken_at, Some(2));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Generalizes `tampering_is_caught_at_its_index`: whatever the
        /// chain length and whichever event is corrupted afterward,
        /// verification always reports that exact index as the break.
        #[test]
        fn tamper_at_any_index_is_caught_at_that_index(length in 1usize..16, offset in 0usize..16) {
            let tamper_index = offset % length;
            let chain = Arc::new(AuditChain::new());
            let writer = chain.register_writer("wf-1").unwrap();
            for i in 0..length {
                append(&chain, &writer, i, i as i64);
            }
            {
                let mut events = chain.events.write().unwrap();
                let wf_events = events.get_mut("wf-1").unwrap();
                wf_events[tamper_index].duration_ms += 1;
            }
            let report = chain.verify_chain("wf-1");
            prop_assert!(!report.verified);
            prop_assert_eq!(report.first_broken_at, Some(tamper_index));
        }
    }

    #[test]
    fn non_monotonic_timestamp_is_rejected() {
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        append(&chain, &writer, 0, 10);
        let err = chain
            .append(
                &writer,
                "e1".into(),
                ts(5),
                None,
                "wf-1",
                1,
                "opcode_dispatch".into(),
                "TRANSFORM".into(),
                AuditResult::Success,
                5,
            )
            .unwrap_err();
        assert!(matches!(err, AuditError::NonMonotonicTimestamp { .. }));
    }

    #[test]
    fn second_writer_is_rejected_until_first_drops() {
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let err = chain.register_writer("wf-1").unwrap_err();
        assert!(matches!(err, AuditError::WriterAlreadyRegistered(_)));
        drop(writer);
        assert!(chain.register_writer("wf-1").is_ok());
    }

    #[test]
    fn independent_workflows_have_independent_chains() {
        let chain = Arc::new(AuditChain::new());
        let writer_a = chain.register_writer("wf-a").unwrap();
        let writer_b = chain.register_writer("wf-b").unwrap();
        chain
            .append(
                &writer_a,
                "a0".into(),
                ts(0),
                None,
                "wf-a",
                0,
                "opcode_dispatch".into(),
                "TRIGGER".into(),
                AuditResult::Success,
                1,
            )
            .unwrap();
        chain
            .append(
                &writer_b,
                "b0".into(),
                ts(0),
                None,
                "wf-b",
                0,
                "opcode_dispatch".into(),
                "TRIGGER".into(),
                AuditResult::Success,
                1,
            )
            .unwrap();
        assert_eq!(chain.events_for("wf-a").len(), 1);
        assert_eq!(chain.events_for("wf-b").len(), 1);
        assert!(chain.verify_chain("wf-a").verified);
        assert!(chain.verify_chain("wf-b").verified);
    }
}
