// Comprehensive error taxonomy for the Semantic Compiler Platform.
//
// Every error code follows the pattern `SCP-X###` where `X` is the
// category letter and `###` is a three-digit number:
//
// - **C** — Compilation errors
// - **V** — Validation errors
// - **D** — Dispatch errors
// - **E** — Executor errors
// - **T** — Timeout errors
// - **I** — Integrity errors
// - **X** — Cancellation

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structured issue surfaced by a compilation stage. Errors of the
/// same stage are batched rather than stopping at the first one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationIssue {
    /// Severity of the issue.
    pub severity: Severity,
    /// Category of compilation failure.
    #[serde(rename = "type")]
    pub issue_type: CompilationIssueType,
    /// The instruction index the issue concerns.
    pub instruction_index: usize,
    /// Human-readable explanation.
    pub message: String,
}

/// Severity of a [`CompilationIssue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Stops the pipeline at the end of the producing stage.
    Error,
    /// Surfaced to the caller but does not stop compilation.
    Warning,
}

/// Category of compilation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationIssueType {
    /// The workflow description failed structural validation (stage 1).
    StructuralInvalid,
    /// A referenced capability does not exist, or is revoked (stage 2).
    UnresolvedSymbol,
    /// A producer/consumer type mismatch was found (stage 3).
    TypeMismatch,
    /// The dependency graph contains a cycle (stage 5).
    DependencyCycle,
    /// Stage 7 could not resolve dispatch metadata for an instruction.
    ServiceResolutionFailed,
}

/// The platform-wide error type. Every crate's public fallible API
/// returns `Result<T, ScpError>` or converts its local error into one.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum ScpError {
    /// `SCP-C###` — the compilation pipeline could not complete a
    /// required transformation.
    #[error("compilation failed with {} issue(s), first: {}", .issues.len(), first_issue_message(.issues))]
    Compilation {
        /// All batched issues from the stage that failed.
        issues: Vec<CompilationIssue>,
        /// Correlation id: the last audit event's `selfHash`, if any.
        correlation_id: Option<String>,
    },

    /// `SCP-V###` — an operand failed shape or bounds validation.
    #[error("validation failed for instruction {instruction_index}: {message}")]
    Validation {
        /// The offending instruction's index.
        instruction_index: usize,
        /// Human-readable explanation.
        message: String,
        /// Correlation id.
        correlation_id: Option<String>,
    },

    /// `SCP-D###` — a node was offline, unreachable, or returned a
    /// checksum mismatch.
    #[error("dispatch failed for plan {plan_id} slice {slice_id}: {reason}")]
    Dispatch {
        /// The compiled workflow's plan id.
        plan_id: String,
        /// The slice that failed to dispatch.
        slice_id: String,
        /// Human-readable reason.
        reason: String,
        /// Correlation id.
        correlation_id: Option<String>,
    },

    /// `SCP-E###` — an executor reported a domain-specific failure.
    #[error("executor error [{code}] for instruction {instruction_index}: {message}")]
    Executor {
        /// Machine-readable executor error code.
        code: String,
        /// The offending instruction's index.
        instruction_index: usize,
        /// Human-readable explanation.
        message: String,
        /// Correlation id.
        correlation_id: Option<String>,
    },

    /// `SCP-T###` — a sync point, executor, or workflow deadline fired.
    #[error("timeout after {elapsed_ms}ms waiting on {what}")]
    Timeout {
        /// What was being waited on (sync point id, instruction index, etc.)
        what: String,
        /// Milliseconds elapsed before the timeout fired.
        elapsed_ms: u64,
        /// Correlation id.
        correlation_id: Option<String>,
    },

    /// `SCP-I###` — an audit chain or IR checksum mismatch. Always fatal;
    /// never partially accepted.
    #[error("integrity error: {message}")]
    Integrity {
        /// Human-readable explanation.
        message: String,
        /// Correlation id.
        correlation_id: Option<String>,
    },

    /// `SCP-X###` — the workflow-scoped cancellation token fired.
    #[error("workflow cancelled: {reason}")]
    Cancelled {
        /// Human-readable reason.
        reason: String,
        /// Correlation id.
        correlation_id: Option<String>,
    },
}

fn first_issue_message(issues: &[CompilationIssue]) -> &str {
    issues.first().map(|i| i.message.as_str()).unwrap_or("none")
}

impl ScpError {
    /// The correlation id carried by this error, if one was attached.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ScpError::Compilation { correlation_id, .. }
            | ScpError::Validation { correlation_id, .. }
            | ScpError::Dispatch { correlation_id, .. }
            | ScpError::Executor { correlation_id, .. }
            | ScpError::Timeout { correlation_id, .. }
            | ScpError::Integrity { correlation_id, .. }
            | ScpError::Cancelled { correlation_id, .. } => correlation_id.as_deref(),
        }
    }
}
