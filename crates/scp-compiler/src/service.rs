//! Stage 7: service resolution — attach dispatch metadata to every
//! service-invoking instruction.

use std::collections::BTreeMap;

use scp_catalog::{Catalog, CapabilityRegistry};
use scp_core::capability::{CapabilityCategory, CapabilityEntry, ExecutorRef};
use scp_core::config::Config;
use scp_core::error::{CompilationIssue, CompilationIssueType, Severity};
use scp_core::ir::{DispatchMetadata, Opcode};
use scp_core::node::ServiceFormat;

use crate::WorkflowDescription;

pub(crate) fn resolve(
    workflow: &WorkflowDescription,
    catalog: &Catalog,
    registry: &CapabilityRegistry,
    config: &Config,
) -> (BTreeMap<usize, DispatchMetadata>, Vec<CompilationIssue>) {
    let doc = catalog.build(registry, config);
    let mut metadata = BTreeMap::new();
    let mut issues = Vec::new();

    for instr in &workflow.instructions {
        let capability_id = match &instr.opcode {
            Opcode::CallService { capability_id, .. } | Opcode::CallAction { capability_id, .. } => capability_id,
            _ => continue,
        };
        match doc.get(capability_id) {
            Some(entry) => {
                metadata.insert(instr.index, dispatch_metadata_for(entry));
            }
            None => issues.push(CompilationIssue {
                severity: Severity::Error,
                issue_type: CompilationIssueType::ServiceResolutionFailed,
                instruction_index: instr.index,
                message: format!("could not resolve dispatch metadata for {capability_id}"),
            }),
        }
    }

    (metadata, issues)
}

fn dispatch_metadata_for(entry: &CapabilityEntry) -> DispatchMetadata {
    let format = if entry.performance.is_llm_call {
        ServiceFormat::LlmCall
    } else if entry.category == CapabilityCategory::Connector {
        ServiceFormat::Connector
    } else {
        match &entry.executor {
            ExecutorRef::FunctionRef { .. } => ServiceFormat::Native,
            ExecutorRef::Http { .. } | ExecutorRef::WebSocket { .. } => ServiceFormat::Http,
            ExecutorRef::Grpc { .. } => ServiceFormat::Grpc,
        }
    };

    DispatchMetadata {
        format,
        timeout_ms: (entry.performance.estimated_duration_ms * 2).max(1_000),
        wasm_memory_mb: None,
        connector_type: (format == ServiceFormat::Connector).then(|| entry.id.clone()),
    }
}
