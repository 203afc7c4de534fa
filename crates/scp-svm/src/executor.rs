//! The executor contract (spec.md §4.9 "Executor contract"): every
//! `CALL_SERVICE`/`CALL_ACTION` instruction dispatches to the executor
//! registered for its `dispatchMetadata.format`. Every executor must be
//! idempotent given identical inputs and must surface a structured
//! error with a machine-readable code.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scp_core::node::ServiceFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cancel::CancellationToken;

/// Everything an executor needs to run one `CALL_SERVICE`/`CALL_ACTION`
/// instruction.
pub struct ExecutorInput {
    /// The instruction's literal named operands.
    pub operands: BTreeMap<String, Value>,
    /// Values read from the instruction's `src` registers, in order.
    pub inputs: Vec<Value>,
    /// Wall-clock budget for this call.
    pub deadline: Duration,
    /// Resolved credential material, if the instruction declared a
    /// vault path.
    pub secrets: Option<String>,
    /// Checked before dispatch and honored cooperatively during I/O.
    pub cancellation: CancellationToken,
}

/// The non-error outcome of an executor call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSuccess {
    /// The call's result value.
    pub output: Value,
    /// Wall-clock duration actually spent.
    pub duration_ms: u64,
    /// Identifiers of downstream services this call reached, for audit
    /// and capability-usage tracking.
    pub services_called: Vec<String>,
}

/// A structured, machine-readable executor failure (spec.md §4.9: "must
/// surface a structured error with a machine-readable code").
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ExecutorError {
    /// Machine-readable failure code (e.g. `"TIMEOUT"`, `"UNREACHABLE"`).
    pub code: String,
    /// Human-readable detail.
    pub message: String,
    /// Arbitrary structured context for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl ExecutorError {
    /// Construct an error with no extra context.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: None,
        }
    }

    /// `true` if cancellation was observed while this executor was
    /// running.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.code == "CANCELLED"
    }
}

/// One of the nine dispatch-format families (spec.md §4.9 "Executor
/// families").
#[async_trait]
pub trait Executor: Send + Sync {
    /// The format this executor serves.
    fn format(&self) -> ServiceFormat;

    /// Run one call. Must be idempotent given identical `input`.
    async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError>;
}

/// Registry of executors, one per [`ServiceFormat`], analogous to the
/// node and trigger-driver registries.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<ServiceFormat, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for its declared format, overwriting any
    /// prior registration.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.format(), executor);
    }

    /// Look up the executor for `format`, if registered.
    #[must_use]
    pub fn get(&self, format: ServiceFormat) -> Option<Arc<dyn Executor>> {
        self.executors.get(&format).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        fn format(&self) -> ServiceFormat {
            ServiceFormat::Native
        }

        async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError> {
            Ok(ExecutorSuccess {
                output: Value::Array(input.inputs),
                duration_ms: 1,
                services_called: vec![],
            })
        }
    }

    #[test]
    fn registry_round_trips_by_format() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(EchoExecutor));
        assert!(registry.get(ServiceFormat::Native).is_some());
        assert!(registry.get(ServiceFormat::Wasm).is_none());
    }

    #[test]
    fn error_display_includes_code_and_message() {
        let err = ExecutorError::new("TIMEOUT", "deadline exceeded");
        assert_eq!(err.to_string(), "TIMEOUT: deadline exceeded");
        assert!(!err.is_cancelled());
    }
}
