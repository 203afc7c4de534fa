//! Stage 3: type check of data flow between producer outputs and
//! consumer inputs.

use std::collections::BTreeMap;

use scp_catalog::{Catalog, CapabilityRegistry};
use scp_core::config::Config;
use scp_core::error::{CompilationIssue, CompilationIssueType, Severity};
use scp_core::ir::{Opcode, Register};

use crate::WorkflowDescription;

/// A register reference, as opposed to a literal operand value, is
/// written `"$register_name"` in an operand map.
fn as_register_ref(value: &serde_json::Value) -> Option<&str> {
    value.as_str().and_then(|s| s.strip_prefix('$'))
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

pub(crate) fn check(
    workflow: &WorkflowDescription,
    catalog: &Catalog,
    registry: &CapabilityRegistry,
    config: &Config,
) -> Vec<CompilationIssue> {
    let mut issues = Vec::new();

    let producers: BTreeMap<&Register, usize> = workflow
        .instructions
        .iter()
        .filter_map(|i| i.dest.as_ref().map(|d| (d, i.index)))
        .collect();

    for instr in &workflow.instructions {
        for src in &instr.src {
            if !producers.contains_key(src) {
                issues.push(CompilationIssue {
                    severity: Severity::Error,
                    issue_type: CompilationIssueType::TypeMismatch,
                    instruction_index: instr.index,
                    message: format!("register {src} has no producing instruction"),
                });
            }
        }
    }

    let doc = catalog.build(registry, config);
    for instr in &workflow.instructions {
        let (capability_id, operands) = match &instr.opcode {
            Opcode::CallService { capability_id, operands } | Opcode::CallAction { capability_id, operands } => {
                (capability_id, operands)
            }
            _ => continue,
        };
        let Some(entry) = doc.get(capability_id) else { continue };
        for field in &entry.inputs {
            let Some(value) = operands.get(&field.name) else {
                if field.required {
                    issues.push(CompilationIssue {
                        severity: Severity::Error,
                        issue_type: CompilationIssueType::TypeMismatch,
                        instruction_index: instr.index,
                        message: format!("missing required operand {} for {capability_id}", field.name),
                    });
                }
                continue;
            };
            if as_register_ref(value).is_some() {
                continue;
            }
            let actual = json_type_name(value);
            if actual != field.schema_type {
                issues.push(CompilationIssue {
                    severity: Severity::Error,
                    issue_type: CompilationIssueType::TypeMismatch,
                    instruction_index: instr.index,
                    message: format!(
                        "operand {} for {capability_id} expects {} but got {actual}",
                        field.name, field.schema_type
                    ),
                });
            }
        }
    }

    issues
}
