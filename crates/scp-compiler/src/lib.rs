#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-compiler
//!
//! The Compilation Pipeline (component C4, stages 1-8): a monotonic
//! transformation from a [`WorkflowDescription`] to a [`scp_core::ir::ResolvedIr`].
//! Each stage may only add annotations or substitute abstract references
//! with resolved ones; no stage drops an instruction.

mod fold;
mod graph;
mod optimize;
mod parallel;
mod service;
mod structural;
mod symbols;
mod typecheck;

use std::collections::BTreeMap;

use scp_catalog::Catalog;
use scp_core::config::Config;
use scp_core::error::{CompilationIssue, Severity};
use scp_core::ir::{IrInstruction, IrMetadata, Opcode, Register, ResolvedIr};

/// A single not-yet-compiled instruction, as submitted by a workflow
/// author. Shares `IrInstruction`'s identity fields but carries none of
/// the annotations later stages attach.
#[derive(Debug, Clone)]
pub struct IntakeInstruction {
    /// Position within the submitted instruction array.
    pub index: usize,
    /// The opcode and its operands.
    pub opcode: Opcode,
    /// The register this instruction writes, if any.
    pub dest: Option<Register>,
    /// Registers this instruction reads.
    pub src: Vec<Register>,
}

/// A workflow as submitted for compilation.
#[derive(Debug, Clone)]
pub struct WorkflowDescription {
    /// Workflow identity.
    pub metadata: IrMetadata,
    /// Instructions in author-specified order.
    pub instructions: Vec<IntakeInstruction>,
}

/// The successful output of the pipeline: Resolved IR plus the
/// compile-time constants stage 4 was able to fold, and any
/// warning-level issues raised along the way.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// Resolved IR, ready for the distribution planner (stage 9).
    pub resolved: ResolvedIr,
    /// Registers stage 4 determined to hold a compile-time constant
    /// value, and what that value is.
    pub constants: BTreeMap<Register, serde_json::Value>,
    /// Non-fatal issues surfaced by stage 8's optimization passes.
    pub warnings: Vec<CompilationIssue>,
}

/// Run the full 8-stage pipeline over `workflow`. Returns the batched
/// issues of whichever stage first reports an `Error`-severity issue,
/// wrapped in `ScpError::Compilation` by the caller if desired — this
/// function returns the raw issue list so callers can choose their own
/// error wrapping.
///
/// # Errors
///
/// Returns `Err(issues)` if any stage reports at least one
/// `Error`-severity [`CompilationIssue`]; issues from that stage are
/// batched together rather than stopping at the first one.
pub fn compile(workflow: &WorkflowDescription, catalog: &Catalog, registry: &scp_catalog::CapabilityRegistry, config: &Config) -> Result<CompileOutput, Vec<CompilationIssue>> {
    tracing::info!(workflow_id = %workflow.metadata.workflow_id, instruction_count = workflow.instructions.len(), "compilation started");

    // Stage 1: structural validation.
    let issues = structural::validate(workflow);
    bail_on_error(&issues)?;

    // Stage 2: symbol resolution.
    let issues = symbols::resolve(workflow, catalog, registry, config);
    bail_on_error(&issues)?;

    // Stage 3: type check of producer/consumer data flow.
    let issues = typecheck::check(workflow, catalog, registry, config);
    bail_on_error(&issues)?;

    // Stage 4: constant folding on pure TRANSFORMs.
    let constants = fold::fold_constants(workflow);

    // Stage 5: dependency graph + topological sort + cycle detection.
    let (dependency_graph, instruction_order, cycle_issues) = graph::build(workflow);
    bail_on_error(&cycle_issues)?;

    // Stage 6: parallel-group inference.
    let parallel_groups = parallel::infer_groups(workflow, &dependency_graph, &instruction_order);

    // Stage 7: service resolution (dispatch metadata).
    let (dispatch_metadata, service_issues) = service::resolve(workflow, catalog, registry, config);
    bail_on_error(&service_issues)?;

    let mut instructions: Vec<IrInstruction> = workflow
        .instructions
        .iter()
        .map(|raw| IrInstruction {
            index: raw.index,
            opcode: raw.opcode.clone(),
            dest: raw.dest.clone(),
            src: raw.src.clone(),
            parallel_group_id: parallel_groups.get(&raw.index).cloned(),
            dispatch_metadata: dispatch_metadata.get(&raw.index).cloned(),
            target_node_id: None,
            slice_id: None,
            required_capabilities: required_capabilities_of(&raw.opcode),
        })
        .collect();
    instructions.sort_by_key(|i| i.index);

    // Stage 8: optimization passes (DCE, CSE, admission checks). These
    // never remove an instruction — only annotate, per the pipeline's
    // monotonic-transformation invariant — so findings surface as
    // warnings rather than structural changes.
    let warnings = optimize::analyze(&instructions, &dependency_graph);

    let resolved = ResolvedIr {
        instructions,
        dependency_graph,
        instruction_order,
        metadata: workflow.metadata.clone(),
        distribution_plan: None,
    };

    tracing::info!(workflow_id = %workflow.metadata.workflow_id, warning_count = warnings.len(), "compilation succeeded");

    Ok(CompileOutput { resolved, constants, warnings })
}

fn bail_on_error(issues: &[CompilationIssue]) -> Result<(), Vec<CompilationIssue>> {
    if issues.iter().any(|i| i.severity == Severity::Error) {
        Err(issues.to_vec())
    } else {
        Ok(())
    }
}

fn required_capabilities_of(opcode: &Opcode) -> Vec<String> {
    match opcode {
        Opcode::CallService { capability_id, .. } | Opcode::CallAction { capability_id, .. } => {
            vec![capability_id.clone()]
        }
        _ => vec![],
    }
}
