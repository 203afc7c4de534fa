//! Stage 2: symbol resolution against the capability catalog.

use scp_catalog::{Catalog, CapabilityRegistry};
use scp_core::config::Config;
use scp_core::error::{CompilationIssue, CompilationIssueType, Severity};
use scp_core::ir::Opcode;

use crate::WorkflowDescription;

pub(crate) fn resolve(
    workflow: &WorkflowDescription,
    catalog: &Catalog,
    registry: &CapabilityRegistry,
    config: &Config,
) -> Vec<CompilationIssue> {
    let doc = catalog.build(registry, config);
    let mut issues = Vec::new();

    for instr in &workflow.instructions {
        let capability_id = match &instr.opcode {
            Opcode::CallService { capability_id, .. } | Opcode::CallAction { capability_id, .. } => capability_id,
            _ => continue,
        };
        if doc.get(capability_id).is_none() {
            issues.push(CompilationIssue {
                severity: Severity::Error,
                issue_type: CompilationIssueType::UnresolvedSymbol,
                instruction_index: instr.index,
                message: format!("capability {capability_id} does not exist or is revoked"),
            });
        }
    }

    issues
}
