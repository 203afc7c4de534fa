#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-svm
//!
//! The Semantic Virtual Machine (components C9/C10, spec.md §4.9): the
//! executor of one [`ExecutionSlice`]'s instructions. State is a sparse
//! register file, an executor registry, a vault handle, and workflow-
//! scoped memory; every step appends exactly one audit event.
//! [`central`] layers the sync-point and remote-slice-invocation
//! behaviour that only the slice landing on the central node exercises.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use scp_audit::{AuditChain, AuditError, AuditWriterHandle};
use scp_core::audit::AuditResult;
use scp_core::ir::{IrInstruction, Opcode, Register};
use scp_core::slice::ExecutionSlice;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::builtin::WorkflowMemory;
use crate::cancel::CancellationToken;
use crate::executor::{ExecutorError, ExecutorInput, ExecutorRegistry};
use crate::vault::VaultHandle;

/// Built-in handlers for the non-service opcodes.
pub mod builtin;
/// Workflow-scoped cancellation.
pub mod cancel;
/// Central-side sync-point handling, remote slice invocation, and the
/// offline buffer.
pub mod central;
/// The executor contract and registry.
pub mod executor;
/// Concrete executor families.
pub mod executors;
/// Durable buffering of dispatches to unreachable nodes.
pub mod offline;
/// Vault handle for secrets resolution.
pub mod vault;

/// The sparse register file one slice executes against.
pub type RegisterFile = BTreeMap<Register, Value>;

/// Failures that can abort a slice's execution.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    /// A `src` register was read before any instruction populated it.
    #[error("register {0} read before being populated")]
    UnsetRegister(Register),
    /// An executor or built-in handler reported a structured failure.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
    /// Cancellation was observed before dispatching instruction `index`.
    #[error("cancelled before instruction {0}")]
    Cancelled(usize),
    /// A strict parallel group's child failed, aborting the parent.
    #[error("parallel group {group_id} failed: {source}")]
    ParallelGroupFailed {
        /// The failing group's id.
        group_id: String,
        /// The child's error.
        source: Box<VmError>,
    },
    /// Appending the audit event for a step failed.
    #[error("audit chain error: {0}")]
    Audit(#[from] AuditError),
}

/// Executes one [`ExecutionSlice`]'s instructions against a register
/// file, dispatching `CALL_SERVICE`/`CALL_ACTION` to the registered
/// executor for their format and everything else to a built-in handler.
pub struct Vm {
    executors: ExecutorRegistry,
    vault: Arc<dyn VaultHandle>,
}

impl Vm {
    /// Construct a VM bound to `executors` and `vault`.
    #[must_use]
    pub fn new(executors: ExecutorRegistry, vault: Arc<dyn VaultHandle>) -> Self {
        Self { executors, vault }
    }

    fn resolve_inputs(instr: &IrInstruction, registers: &RegisterFile) -> Result<Vec<Value>, VmError> {
        instr
            .src
            .iter()
            .map(|reg| registers.get(reg).cloned().ok_or_else(|| VmError::UnsetRegister(reg.clone())))
            .collect()
    }

    async fn execute_one(
        &self,
        instr: &IrInstruction,
        registers: &RegisterFile,
        memory: &WorkflowMemory,
        cancellation: &CancellationToken,
    ) -> Result<Value, VmError> {
        if cancellation.is_cancelled() {
            return Err(VmError::Executor(ExecutorError::new("CANCELLED", "cancellation observed before dispatch")));
        }
        let inputs = Self::resolve_inputs(instr, registers)?;

        match &instr.opcode {
            Opcode::Trigger { .. } => Ok(inputs.first().cloned().unwrap_or(Value::Null)),
            Opcode::CallService { operands, .. } | Opcode::CallAction { operands, .. } => {
                let metadata = instr.dispatch_metadata.as_ref().ok_or_else(|| {
                    ExecutorError::new("NO_DISPATCH_METADATA", "service-invoking instruction missing dispatch metadata")
                })?;
                let executor = self.executors.get(metadata.format).ok_or_else(|| {
                    ExecutorError::new("NO_EXECUTOR", format!("no executor registered for format {:?}", metadata.format))
                })?;
                let outcome = executor
                    .execute(ExecutorInput {
                        operands: operands.clone(),
                        inputs,
                        deadline: Duration::from_millis(metadata.timeout_ms),
                        secrets: None,
                        cancellation: cancellation.clone(),
                    })
                    .await?;
                Ok(outcome.output)
            }
            Opcode::Transform { expression, params } => builtin::transform(expression, params, &inputs).map_err(Into::into),
            Opcode::Filter { predicate, params } => builtin::filter(predicate, params, &inputs).map_err(Into::into),
            Opcode::Aggregate { function } => builtin::aggregate(function, &inputs).map_err(Into::into),
            Opcode::Validate { schema } => builtin::validate(schema, &inputs).map_err(Into::into),
            Opcode::LoadResource { uri } => builtin::load_resource(uri, self.vault.as_ref(), memory).map_err(Into::into),
            Opcode::StoreMemory { key } => Ok(builtin::store_memory(key, inputs.first().cloned().unwrap_or(Value::Null), memory)),
            Opcode::ParallelSpawn { .. } => {
                unreachable!("ParallelSpawn is intercepted by Vm::run_slice before reaching execute_one")
            }
            Opcode::EventStateMachine { machine_id, .. } => Ok(builtin::event_state_machine(machine_id, &inputs)),
            Opcode::HandlePropagated { machine_id } => Ok(builtin::handle_propagated(machine_id, &inputs)),
            Opcode::RemoteCommand { target_node_id, command } => Ok(builtin::remote_command(target_node_id, command)),
            Opcode::HandleRemoteCmd { target_node_id } => Ok(builtin::handle_remote_cmd(target_node_id, &inputs)),
        }
    }

    async fn record_and_apply(
        &self,
        audit: &AuditChain,
        writer: &AuditWriterHandle,
        workflow_id: &str,
        instr: &IrInstruction,
        registers: &mut RegisterFile,
        outcome: Result<Value, VmError>,
        duration_ms: u64,
    ) -> Result<(), VmError> {
        let result = if outcome.is_ok() { AuditResult::Success } else { AuditResult::Failed };
        audit.append(
            writer,
            Uuid::new_v4().to_string(),
            Utc::now(),
            None,
            workflow_id,
            instr.index,
            "opcode_dispatch".to_string(),
            instr.opcode.name().to_string(),
            result,
            duration_ms,
        )?;
        match outcome {
            Ok(value) => {
                if let Some(dest) = &instr.dest {
                    registers.insert(dest.clone(), value);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run every instruction of `slice` in `instruction_order`, starting
    /// from `registers` (already seeded with inbound bindings), and
    /// return the fully populated register file. Aborts on the first
    /// unset-register fault, executor failure, or strict parallel-group
    /// failure; cancellation is checked before every dispatch.
    pub async fn run_slice(
        &self,
        audit: &AuditChain,
        writer: &AuditWriterHandle,
        workflow_id: &str,
        slice: &ExecutionSlice,
        mut registers: RegisterFile,
        memory: &WorkflowMemory,
        cancellation: &CancellationToken,
    ) -> Result<RegisterFile, VmError> {
        let mut handled: BTreeSet<usize> = BTreeSet::new();

        for &index in &slice.instruction_order {
            if handled.contains(&index) {
                continue;
            }
            if cancellation.is_cancelled() {
                return Err(VmError::Cancelled(index));
            }
            let instr = slice
                .instructions
                .iter()
                .find(|i| i.index == index)
                .expect("instruction_order is consistent with instructions");

            if let Opcode::ParallelSpawn { group_id, strict } = &instr.opcode {
                handled.insert(index);
                let started = Instant::now();
                self.record_and_apply(audit, writer, workflow_id, instr, &mut registers, Ok(Value::Null), started.elapsed().as_millis() as u64)
                    .await?;

                let members: Vec<IrInstruction> = slice
                    .instructions
                    .iter()
                    .filter(|i| i.parallel_group_id.as_deref() == Some(group_id.as_str()))
                    .cloned()
                    .collect();
                let snapshot = registers.clone();
                let child_futures = members.iter().map(|member| {
                    let snapshot = snapshot.clone();
                    async move {
                        let started = Instant::now();
                        let outcome = self.execute_one(member, &snapshot, memory, cancellation).await;
                        (member.clone(), outcome, started.elapsed().as_millis() as u64)
                    }
                });
                let results = futures::future::join_all(child_futures).await;

                let mut first_error: Option<VmError> = None;
                for (member, outcome, duration_ms) in results {
                    handled.insert(member.index);
                    let recorded_outcome = if *strict {
                        outcome
                    } else {
                        outcome.or_else(|e| Ok(json!({"error": e.to_string()})))
                    };
                    if let Err(e) = self.record_and_apply(audit, writer, workflow_id, &member, &mut registers, recorded_outcome, duration_ms).await {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
                if let Some(e) = first_error {
                    return Err(VmError::ParallelGroupFailed {
                        group_id: group_id.clone(),
                        source: Box::new(e),
                    });
                }
                continue;
            }

            let started = Instant::now();
            let outcome = self.execute_one(instr, &registers, memory, cancellation).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            self.record_and_apply(audit, writer, workflow_id, instr, &mut registers, outcome, duration_ms).await?;
            handled.insert(index);
        }

        Ok(registers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorRegistry;
    use crate::executors::NativeExecutor;
    use crate::vault::InMemoryVault;
    use scp_core::ir::DispatchMetadata;
    use scp_core::node::ServiceFormat;
    use scp_core::slice::compute_slice_checksum;
    use std::sync::Arc;

    fn instr(index: usize, dest: &str, src: &[&str], opcode: Opcode) -> IrInstruction {
        IrInstruction {
            index,
            opcode,
            dest: Some(dest.to_string()),
            src: src.iter().map(|s| s.to_string()).collect(),
            parallel_group_id: None,
            dispatch_metadata: None,
            target_node_id: None,
            slice_id: None,
            required_capabilities: vec![],
        }
    }

    fn slice_of(instructions: Vec<IrInstruction>) -> ExecutionSlice {
        let instruction_order = instructions.iter().map(|i| i.index).collect();
        ExecutionSlice {
            slice_id: "central".into(),
            node_id: "central".into(),
            checksum: compute_slice_checksum(&instructions),
            instructions,
            instruction_order,
            input_bindings: BTreeMap::new(),
            output_bindings: vec![],
            is_root: true,
            depends_on_slices: vec![],
            estimated_duration_ms: 10,
        }
    }

    fn vm() -> Vm {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NativeExecutor));
        Vm::new(registry, Arc::new(InMemoryVault::new()))
    }

    #[tokio::test]
    async fn transform_chain_populates_registers_in_order() {
        let instructions = vec![instr(
            0,
            "b",
            &["a"],
            Opcode::Transform { expression: "multiply".into(), params: BTreeMap::from([("factor".to_string(), json!(2))]) },
        )];
        let slice = slice_of(instructions);
        let mut initial = RegisterFile::new();
        initial.insert("a".to_string(), json!(21));
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let memory = WorkflowMemory::new();
        let cancellation = CancellationToken::new();

        let result = vm().run_slice(&chain, &writer, "wf-1", &slice, initial, &memory, &cancellation).await.unwrap();
        assert_eq!(result.get("b"), Some(&json!(42.0)));
        assert!(chain.verify_chain("wf-1").verified);
        assert_eq!(chain.events_for("wf-1").len(), 1);
    }

    #[tokio::test]
    async fn reading_an_unset_register_is_a_fault() {
        let instructions = vec![instr(0, "b", &["a"], Opcode::Transform { expression: "identity".into(), params: BTreeMap::new() })];
        let slice = slice_of(instructions);
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let memory = WorkflowMemory::new();
        let cancellation = CancellationToken::new();

        let err = vm().run_slice(&chain, &writer, "wf-1", &slice, RegisterFile::new(), &memory, &cancellation).await.unwrap_err();
        assert!(matches!(err, VmError::UnsetRegister(r) if r == "a"));
    }

    #[tokio::test]
    async fn strict_parallel_group_aborts_on_first_child_failure() {
        let spawn = IrInstruction {
            index: 0,
            opcode: Opcode::ParallelSpawn { group_id: "g1".into(), strict: true },
            dest: None,
            src: vec![],
            parallel_group_id: None,
            dispatch_metadata: None,
            target_node_id: None,
            slice_id: None,
            required_capabilities: vec![],
        };
        let mut ok_child = instr(1, "ok", &[], Opcode::Transform { expression: "identity".into(), params: BTreeMap::new() });
        ok_child.parallel_group_id = Some("g1".to_string());
        let mut bad_child = instr(2, "bad", &[], Opcode::Transform { expression: "unknown_expr".into(), params: BTreeMap::new() });
        bad_child.parallel_group_id = Some("g1".to_string());

        let slice = slice_of(vec![spawn, ok_child, bad_child]);
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let memory = WorkflowMemory::new();
        let cancellation = CancellationToken::new();

        let err = vm().run_slice(&chain, &writer, "wf-1", &slice, RegisterFile::new(), &memory, &cancellation).await.unwrap_err();
        assert!(matches!(err, VmError::ParallelGroupFailed { group_id, .. } if group_id == "g1"));
    }

    #[tokio::test]
    async fn lenient_parallel_group_captures_child_error_as_a_value() {
        let spawn = IrInstruction {
            index: 0,
            opcode: Opcode::ParallelSpawn { group_id: "g1".into(), strict: false },
            dest: None,
            src: vec![],
            parallel_group_id: None,
            dispatch_metadata: None,
            target_node_id: None,
            slice_id: None,
            required_capabilities: vec![],
        };
        let mut bad_child = instr(1, "bad", &[], Opcode::Transform { expression: "unknown_expr".into(), params: BTreeMap::new() });
        bad_child.parallel_group_id = Some("g1".to_string());

        let slice = slice_of(vec![spawn, bad_child]);
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let memory = WorkflowMemory::new();
        let cancellation = CancellationToken::new();

        let result = vm().run_slice(&chain, &writer, "wf-1", &slice, RegisterFile::new(), &memory, &cancellation).await.unwrap();
        assert!(result.get("bad").unwrap().get("error").is_some());
    }

    #[tokio::test]
    async fn call_service_dispatches_to_the_registered_executor() {
        let mut call = instr(0, "out", &[], Opcode::CallService { capability_id: "svc".into(), operands: BTreeMap::new() });
        call.dispatch_metadata = Some(DispatchMetadata {
            format: ServiceFormat::Native,
            timeout_ms: 1000,
            wasm_memory_mb: None,
            connector_type: None,
        });
        let slice = slice_of(vec![call]);
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let memory = WorkflowMemory::new();
        let cancellation = CancellationToken::new();

        let result = vm().run_slice(&chain, &writer, "wf-1", &slice, RegisterFile::new(), &memory, &cancellation).await.unwrap();
        assert!(result.contains_key("out"));
    }

    #[tokio::test]
    async fn cancellation_aborts_before_the_next_instruction() {
        let instructions = vec![
            instr(0, "a", &[], Opcode::Transform { expression: "identity".into(), params: BTreeMap::new() }),
            instr(1, "b", &["a"], Opcode::Transform { expression: "identity".into(), params: BTreeMap::new() }),
        ];
        let slice = slice_of(instructions);
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let memory = WorkflowMemory::new();
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let err = vm().run_slice(&chain, &writer, "wf-1", &slice, RegisterFile::new(), &memory, &cancellation).await.unwrap_err();
        assert!(matches!(err, VmError::Cancelled(0)));
    }
}
