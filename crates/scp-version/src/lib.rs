#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-version
//!
//! The Version Lifecycle manager (component C6): enforces the DRAFT →
//! VALIDATING → VALID → ACTIVE ⇄ EXECUTING state machine, checksum
//! conflict detection on submission, DRAFT/ARCHIVED lineage, and atomic
//! promotion (single `ACTIVE` version per project).

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use scp_core::version::{ProjectVersion, VersionStatus};
use thiserror::Error;

/// Errors specific to version lifecycle transitions. Wrapped into
/// [`scp_core::error::ScpError::Integrity`] at the platform boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// No version exists with the given id.
    #[error("version {0} not found")]
    NotFound(String),
    /// The requested transition is illegal per [`VersionStatus::can_transition_to`].
    #[error("illegal transition for version {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// The version id.
        id: String,
        /// Current status.
        from: VersionStatus,
        /// Requested status.
        to: VersionStatus,
    },
    /// `ir_checksum` on submission does not match the computed digest of
    /// `ir_binary`: the IR was tampered with, or corrupted in transit.
    #[error("checksum conflict for version {id}: stored {stored}, computed {computed}")]
    ChecksumConflict {
        /// The version id.
        id: String,
        /// The checksum stored on the existing record.
        stored: String,
        /// The checksum computed from the submitted bytes.
        computed: String,
    },
}

/// In-memory store of [`ProjectVersion`] records with lifecycle
/// enforcement. A real deployment backs this with a database; the
/// in-process store here is the authoritative state machine either way.
#[derive(Default)]
pub struct VersionStore {
    versions: RwLock<BTreeMap<String, ProjectVersion>>,
    next_seq: RwLock<BTreeMap<String, u64>>,
}

impl VersionStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `DRAFT` version for `project_id`, optionally forked
    /// from `parent_version`.
    pub fn create_draft(
        &self,
        project_id: &str,
        ir_binary: Vec<u8>,
        parent_version: Option<u64>,
        change_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> ProjectVersion {
        let mut next_seq = self.next_seq.write().expect("lock poisoned");
        let version = next_seq.entry(project_id.to_string()).or_insert(0);
        *version += 1;
        let version_number = *version;
        drop(next_seq);

        let ir_checksum = scp_core::sha256_hex(&ir_binary);
        let record = ProjectVersion {
            id: format!("{project_id}-v{version_number}"),
            project_id: project_id.to_string(),
            version: version_number,
            parent_version,
            status: VersionStatus::Draft,
            ir_binary,
            ir_checksum,
            validated_by: None,
            validated_at: None,
            change_reason,
            created_at: now,
            archived_at: None,
        };

        self.versions.write().expect("lock poisoned").insert(record.id.clone(), record.clone());
        tracing::info!(version_id = %record.id, project_id, version_number, "draft version created");
        record
    }

    /// Look up a version by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ProjectVersion> {
        self.versions.read().expect("lock poisoned").get(id).cloned()
    }

    /// All versions for a project, in ascending version order.
    #[must_use]
    pub fn list_for_project(&self, project_id: &str) -> Vec<ProjectVersion> {
        let mut versions: Vec<ProjectVersion> = self
            .versions
            .read()
            .expect("lock poisoned")
            .values()
            .filter(|v| v.project_id == project_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version);
        versions
    }

    /// Submit `id` for validation: `DRAFT -> VALIDATING`, verifying the
    /// caller's `ir_checksum` against the stored one.
    pub fn submit_for_validation(&self, id: &str, submitted_checksum: &str) -> Result<ProjectVersion, VersionError> {
        self.transition(id, VersionStatus::Validating, |record| {
            if record.ir_checksum != submitted_checksum {
                return Err(VersionError::ChecksumConflict {
                    id: record.id.clone(),
                    stored: record.ir_checksum.clone(),
                    computed: submitted_checksum.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Mark `id` as validated: `VALIDATING -> VALID`.
    pub fn mark_valid(&self, id: &str, validated_by: &str, now: DateTime<Utc>) -> Result<ProjectVersion, VersionError> {
        self.transition(id, VersionStatus::Valid, |record| {
            record.validated_by = Some(validated_by.to_string());
            record.validated_at = Some(now);
            Ok(())
        })
    }

    /// Fall validation back to `DRAFT` (validation failed).
    pub fn fail_validation(&self, id: &str) -> Result<ProjectVersion, VersionError> {
        self.transition(id, VersionStatus::Draft, |_| Ok(()))
    }

    /// Promote `id` to `ACTIVE`. Atomic across the whole project: any
    /// version currently `ACTIVE` for the same project is archived in
    /// the same write-lock critical section.
    pub fn promote(&self, id: &str, now: DateTime<Utc>) -> Result<ProjectVersion, VersionError> {
        let mut versions = self.versions.write().expect("lock poisoned");
        let project_id = versions.get(id).ok_or_else(|| VersionError::NotFound(id.to_string()))?.project_id.clone();

        {
            let record = versions.get(id).expect("checked above");
            if !record.status.can_transition_to(VersionStatus::Active) {
                return Err(VersionError::IllegalTransition {
                    id: id.to_string(),
                    from: record.status,
                    to: VersionStatus::Active,
                });
            }
        }

        let currently_active: Option<String> = versions
            .values()
            .find(|v| v.project_id == project_id && v.status == VersionStatus::Active && v.id != id)
            .map(|v| v.id.clone());

        if let Some(active_id) = currently_active {
            let archived = versions.get_mut(&active_id).expect("found above");
            archived.status = VersionStatus::Archived;
            archived.archived_at = Some(now);
            tracing::info!(version_id = %active_id, "version archived by atomic promotion");
        }

        let promoted = versions.get_mut(id).expect("checked above");
        promoted.status = VersionStatus::Active;
        tracing::info!(version_id = %id, project_id, "version promoted to active");
        Ok(promoted.clone())
    }

    /// `EXECUTING` while a workflow run is in flight.
    pub fn begin_execution(&self, id: &str) -> Result<ProjectVersion, VersionError> {
        self.transition(id, VersionStatus::Executing, |_| Ok(()))
    }

    /// Back to `ACTIVE` once a workflow run completes.
    pub fn end_execution(&self, id: &str) -> Result<ProjectVersion, VersionError> {
        self.transition(id, VersionStatus::Active, |_| Ok(()))
    }

    /// Archive `id` unconditionally. Terminal; re-editing requires a new
    /// `DRAFT` linked via `parent_version`.
    pub fn archive(&self, id: &str, now: DateTime<Utc>) -> Result<ProjectVersion, VersionError> {
        self.transition(id, VersionStatus::Archived, |record| {
            record.archived_at = Some(now);
            Ok(())
        })
    }

    fn transition(
        &self,
        id: &str,
        to: VersionStatus,
        mutate: impl FnOnce(&mut ProjectVersion) -> Result<(), VersionError>,
    ) -> Result<ProjectVersion, VersionError> {
        let mut versions = self.versions.write().expect("lock poisoned");
        let record = versions.get_mut(id).ok_or_else(|| VersionError::NotFound(id.to_string()))?;

        if !record.status.can_transition_to(to) {
            return Err(VersionError::IllegalTransition { id: id.to_string(), from: record.status, to });
        }

        mutate(record)?;
        record.status = to;
        tracing::info!(version_id = %id, to = ?to, "version transitioned");
        Ok(record.clone())
    }
}
