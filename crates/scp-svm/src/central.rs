//! Central-side orchestration (spec.md §4.9 "Remote slice invocation",
//! "Offline buffer"): runs the central slice, proactively dispatching
//! every remote slice whose inputs are already known and pausing at
//! each [`SyncPoint`] for its awaited slices to land.
//!
//! Remote-to-remote input chaining (a slice bound to another *remote*
//! slice's output rather than a trigger) is out of scope: none of the
//! spec's worked scenarios require it, and proactively dispatching such
//! a slice before its producer has run would just be wrong. Those
//! slices are logged and skipped at dispatch time; if a sync point ever
//! awaits one, it times out like any other unreachable slice.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scp_audit::{AuditChain, AuditWriterHandle};
use scp_core::audit::AuditResult;
use scp_core::slice::{default_sync_timeout_ms, DistributionPlan, ExecutionSlice, InputBinding, SyncPoint};
use scp_dispatcher::{Dispatcher, SliceDispatchPayload, SliceResultPayload, SliceStatus};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::builtin::WorkflowMemory;
use crate::cancel::CancellationToken;
use crate::{RegisterFile, Vm, VmError};

/// Failures that can abort a plan's execution.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The plan has no slice assigned to the central node.
    #[error("distribution plan {0} has no central slice")]
    MissingCentralSlice(String),
    /// Executing a segment of the central slice faulted.
    #[error(transparent)]
    Vm(#[from] VmError),
    /// Appending an audit event faulted.
    #[error(transparent)]
    Audit(#[from] scp_audit::AuditError),
    /// A `FAIL`-policy sync point timed out.
    #[error("sync point {sync_id} in plan {plan_id} failed: last good audit hash {last_good_audit_hash}")]
    SyncPointFailed {
        /// The plan this sync point belongs to.
        plan_id: String,
        /// The sync point that failed.
        sync_id: String,
        /// The self-hash of the last successfully appended audit event,
        /// so the caller can pinpoint where the chain stopped.
        last_good_audit_hash: String,
    },
}

struct PendingDispatch {
    handle: JoinHandle<Result<SliceResultPayload, scp_dispatcher::DispatchError>>,
    node_id: String,
    payload: SliceDispatchPayload,
}

/// Composes [`Vm`], [`Dispatcher`], [`AuditChain`], and
/// [`crate::offline::OfflineBuffer`] to run a whole [`DistributionPlan`]
/// from the central node's point of view.
pub struct CentralOrchestrator {
    vm: Vm,
    dispatcher: Arc<Dispatcher>,
    offline: Arc<crate::offline::OfflineBuffer>,
}

impl CentralOrchestrator {
    /// Build an orchestrator around `vm`, `dispatcher`, and `offline`.
    #[must_use]
    pub fn new(vm: Vm, dispatcher: Arc<Dispatcher>, offline: Arc<crate::offline::OfflineBuffer>) -> Self {
        Self { vm, dispatcher, offline }
    }

    /// Run `plan`'s central slice end to end: proactively dispatch every
    /// remote slice whose inputs are already resolvable, execute the
    /// central instructions between sync points, and resolve each sync
    /// point per its `on_timeout` policy as it's reached.
    pub async fn execute_plan(
        &self,
        plan_id: &str,
        plan: &DistributionPlan,
        workflow_id: &str,
        audit: &AuditChain,
        writer: &AuditWriterHandle,
        initial_registers: RegisterFile,
        memory: &WorkflowMemory,
        cancellation: &CancellationToken,
    ) -> Result<RegisterFile, OrchestratorError> {
        let central_slice = plan
            .slices
            .get(scp_core::slice::CENTRAL_SLICE_ID)
            .ok_or_else(|| OrchestratorError::MissingCentralSlice(plan_id.to_string()))?;

        let mut pending = self.dispatch_remote_slices(plan_id, plan, &initial_registers);

        let order = &central_slice.instruction_order;
        let mut cursor = 0usize;
        let mut registers = initial_registers;

        for sync_point in &plan.sync_points {
            let boundary = order
                .iter()
                .position(|&index| index == sync_point.pause_before_instruction)
                .unwrap_or(order.len());

            if boundary > cursor {
                let segment = build_segment(central_slice, &order[cursor..boundary]);
                registers = self
                    .vm
                    .run_slice(audit, writer, workflow_id, &segment, registers, memory, cancellation)
                    .await?;
            }
            cursor = boundary;

            self.resolve_sync_point(plan_id, sync_point, &mut pending, &mut registers, workflow_id, audit, writer).await?;
        }

        if cursor < order.len() {
            let segment = build_segment(central_slice, &order[cursor..]);
            registers = self.vm.run_slice(audit, writer, workflow_id, &segment, registers, memory, cancellation).await?;
        }

        Ok(registers)
    }

    /// Spawn a dispatch for every non-central slice whose declared
    /// inputs are all `FromTrigger` bindings already present in
    /// `initial_registers`. Slices with a `FromSlice` binding are
    /// skipped (see module docs).
    fn dispatch_remote_slices(&self, plan_id: &str, plan: &DistributionPlan, initial_registers: &RegisterFile) -> BTreeMap<String, PendingDispatch> {
        let mut pending = BTreeMap::new();

        for (slice_id, slice) in &plan.slices {
            if slice.slice_id == scp_core::slice::CENTRAL_SLICE_ID {
                continue;
            }
            if slice.input_bindings.values().any(|binding| matches!(binding, InputBinding::FromSlice { .. })) {
                tracing::warn!(slice_id, "skipping proactive dispatch: slice depends on another remote slice's output");
                continue;
            }

            let mut register_values = BTreeMap::new();
            for (register, binding) in &slice.input_bindings {
                if let InputBinding::FromTrigger { .. } = binding {
                    if let Some(value) = initial_registers.get(register) {
                        register_values.insert(register.clone(), value.clone());
                    }
                }
            }

            let timeout_ms = plan
                .sync_points
                .iter()
                .find(|sp| sp.await_slice_ids.contains(slice_id))
                .map_or_else(|| default_sync_timeout_ms(slice.estimated_duration_ms), |sp| sp.timeout_ms);

            let payload = SliceDispatchPayload {
                plan_id: plan_id.to_string(),
                slice_id: slice_id.clone(),
                instructions: slice.instructions.clone(),
                instruction_order: slice.instruction_order.clone(),
                register_values,
                timeout_ms,
                checksum: slice.checksum.clone(),
            };

            let node_id = slice.node_id.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            let dispatch_payload = payload.clone();
            let handle = tokio::spawn(async move { dispatcher.dispatch(&node_id, dispatch_payload).await });

            pending.insert(slice_id.clone(), PendingDispatch { handle, node_id: slice.node_id.clone(), payload });
        }

        pending
    }

    /// Wait for every slice `sync_point` awaits, applying its
    /// `on_timeout` policy to whichever ones don't land successfully
    /// within `sync_point.timeout_ms`.
    async fn resolve_sync_point(
        &self,
        plan_id: &str,
        sync_point: &SyncPoint,
        pending: &mut BTreeMap<String, PendingDispatch>,
        registers: &mut RegisterFile,
        workflow_id: &str,
        audit: &AuditChain,
        writer: &AuditWriterHandle,
    ) -> Result<(), OrchestratorError> {
        for slice_id in &sync_point.await_slice_ids {
            let Some(dispatch) = pending.remove(slice_id) else {
                continue;
            };

            let outcome = tokio::time::timeout(Duration::from_millis(sync_point.timeout_ms), dispatch.handle).await;
            let result = match outcome {
                Ok(Ok(Ok(result))) if result.status == SliceStatus::Success => Some(result),
                _ => None,
            };

            match result {
                Some(result) => {
                    for flow in &sync_point.inbound_flows {
                        if &flow.from_node_id == slice_id || &flow.from_node_id == &dispatch.node_id {
                            if let Some(value) = result.output_registers.get(&flow.from_register) {
                                registers.insert(flow.to_register.clone(), value.clone());
                            }
                        }
                    }
                }
                None => {
                    self.offline.enqueue(&dispatch.node_id, dispatch.payload);
                    self.apply_timeout_policy(plan_id, sync_point, registers, workflow_id, audit, writer)?;
                }
            }
        }
        Ok(())
    }

    fn apply_timeout_policy(
        &self,
        plan_id: &str,
        sync_point: &SyncPoint,
        registers: &mut RegisterFile,
        workflow_id: &str,
        audit: &AuditChain,
        writer: &AuditWriterHandle,
    ) -> Result<(), OrchestratorError> {
        use scp_core::ir::OnTimeout;

        match sync_point.on_timeout {
            OnTimeout::Fail => {
                let last_good_audit_hash =
                    audit.events_for(workflow_id).last().map_or_else(|| scp_core::GENESIS_HASH.to_string(), |e| e.self_hash.clone());
                Err(OrchestratorError::SyncPointFailed { plan_id: plan_id.to_string(), sync_id: sync_point.sync_id.clone(), last_good_audit_hash })
            }
            OnTimeout::Skip => {
                tracing::warn!(sync_id = %sync_point.sync_id, "sync point timed out, skipping its bindings per policy");
                Ok(())
            }
            OnTimeout::UseDefault => {
                let default = sync_point.default_value.clone().unwrap_or(Value::Null);
                for flow in &sync_point.inbound_flows {
                    registers.insert(flow.to_register.clone(), default.clone());
                }
                audit.append(
                    writer,
                    Uuid::new_v4().to_string(),
                    Utc::now(),
                    None,
                    workflow_id,
                    sync_point.pause_before_instruction,
                    "sync_point".to_string(),
                    "USE_DEFAULT".to_string(),
                    AuditResult::Failover,
                    0,
                )?;
                Ok(())
            }
        }
    }
}

/// A throwaway slice covering exactly the instructions in `order`,
/// so [`Vm::run_slice`] can execute one segment of the central slice
/// between two sync points.
fn build_segment(central_slice: &ExecutionSlice, order: &[usize]) -> ExecutionSlice {
    let instructions: Vec<_> = central_slice.instructions.iter().filter(|i| order.contains(&i.index)).cloned().collect();
    ExecutionSlice {
        slice_id: central_slice.slice_id.clone(),
        node_id: central_slice.node_id.clone(),
        checksum: scp_core::slice::compute_slice_checksum(&instructions),
        instructions,
        instruction_order: order.to_vec(),
        input_bindings: central_slice.input_bindings.clone(),
        output_bindings: central_slice.output_bindings.clone(),
        is_root: central_slice.is_root,
        depends_on_slices: central_slice.depends_on_slices.clone(),
        estimated_duration_ms: central_slice.estimated_duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorRegistry;
    use crate::executors::NativeExecutor;
    use crate::vault::InMemoryVault;
    use scp_core::ir::{IrInstruction, OnTimeout, Opcode};
    use scp_core::slice::{compute_slice_checksum, CrossNodeDataFlow};
    use scp_dispatcher::{ChannelTransport, HttpTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn transform(index: usize, dest: &str, src: &[&str]) -> IrInstruction {
        IrInstruction {
            index,
            opcode: Opcode::Transform { expression: "identity".into(), params: BTreeMap::new() },
            dest: Some(dest.to_string()),
            src: src.iter().map(|s| s.to_string()).collect(),
            parallel_group_id: None,
            dispatch_metadata: None,
            target_node_id: None,
            slice_id: None,
            required_capabilities: vec![],
        }
    }

    fn orchestrator() -> CentralOrchestrator {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NativeExecutor));
        let vm = Vm::new(registry, Arc::new(InMemoryVault::new()));
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(ChannelTransport::new()), Arc::new(HttpTransport::new()), 8));
        let offline = Arc::new(crate::offline::OfflineBuffer::new());
        CentralOrchestrator::new(vm, dispatcher, offline)
    }

    fn one_slice_plan(on_timeout: OnTimeout, default_value: Option<Value>) -> DistributionPlan {
        let central_instructions = vec![transform(0, "final", &["from_mcu"])];
        let central_slice = ExecutionSlice {
            slice_id: "central".into(),
            node_id: "central".into(),
            checksum: compute_slice_checksum(&central_instructions),
            instruction_order: central_instructions.iter().map(|i| i.index).collect(),
            instructions: central_instructions,
            input_bindings: BTreeMap::new(),
            output_bindings: vec![],
            is_root: true,
            depends_on_slices: vec!["mcu".into()],
            estimated_duration_ms: 10,
        };

        let mut slices = BTreeMap::new();
        slices.insert("central".to_string(), central_slice);

        DistributionPlan {
            slices,
            cross_node_flows: vec![CrossNodeDataFlow {
                flow_id: "f1".into(),
                from_node_id: "mcu".into(),
                from_register: "reading".into(),
                to_node_id: "central".into(),
                to_register: "from_mcu".into(),
                payload_schema: None,
            }],
            sync_points: vec![SyncPoint {
                sync_id: "sp1".into(),
                pause_before_instruction: 0,
                await_slice_ids: vec!["mcu".into()],
                inbound_flows: vec![CrossNodeDataFlow {
                    flow_id: "f1".into(),
                    from_node_id: "mcu".into(),
                    from_register: "reading".into(),
                    to_node_id: "central".into(),
                    to_register: "from_mcu".into(),
                    payload_schema: None,
                }],
                resume_at_instruction: 0,
                timeout_ms: 50,
                on_timeout,
                default_value,
            }],
            critical_path_ms: 60,
            is_distributed: true,
        }
    }

    #[tokio::test]
    async fn missing_central_slice_is_rejected() {
        let plan = DistributionPlan {
            slices: BTreeMap::new(),
            cross_node_flows: vec![],
            sync_points: vec![],
            critical_path_ms: 0,
            is_distributed: false,
        };
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let memory = WorkflowMemory::new();
        let cancellation = CancellationToken::new();

        let err = orchestrator()
            .execute_plan("plan-1", &plan, "wf-1", &chain, &writer, RegisterFile::new(), &memory, &cancellation)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingCentralSlice(p) if p == "plan-1"));
    }

    #[tokio::test]
    async fn unreachable_sync_point_fails_under_fail_policy() {
        let plan = one_slice_plan(OnTimeout::Fail, None);
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let memory = WorkflowMemory::new();
        let cancellation = CancellationToken::new();

        let err = orchestrator()
            .execute_plan("plan-1", &plan, "wf-1", &chain, &writer, RegisterFile::new(), &memory, &cancellation)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::SyncPointFailed { sync_id, .. } if sync_id == "sp1"));
    }

    #[tokio::test]
    async fn unreachable_sync_point_uses_default_and_emits_failover() {
        let plan = one_slice_plan(OnTimeout::UseDefault, Some(json!(0)));
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let memory = WorkflowMemory::new();
        let cancellation = CancellationToken::new();

        let registers = orchestrator()
            .execute_plan("plan-1", &plan, "wf-1", &chain, &writer, RegisterFile::new(), &memory, &cancellation)
            .await
            .unwrap();
        assert_eq!(registers.get("final"), Some(&json!(0)));
        assert!(chain.events_for("wf-1").iter().any(|e| e.action == "USE_DEFAULT" && e.result == AuditResult::Failover));
    }

    #[tokio::test]
    async fn unreachable_sync_point_skips_binding_and_later_read_faults() {
        let plan = one_slice_plan(OnTimeout::Skip, None);
        let chain = Arc::new(AuditChain::new());
        let writer = chain.register_writer("wf-1").unwrap();
        let memory = WorkflowMemory::new();
        let cancellation = CancellationToken::new();

        let err = orchestrator()
            .execute_plan("plan-1", &plan, "wf-1", &chain, &writer, RegisterFile::new(), &memory, &cancellation)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Vm(VmError::UnsetRegister(r)) if r == "from_mcu"));
    }
}
