//! Stage 1: structural validation of the workflow description.

use std::collections::BTreeMap;

use scp_core::error::{CompilationIssue, CompilationIssueType, Severity};

use crate::WorkflowDescription;

pub(crate) fn validate(workflow: &WorkflowDescription) -> Vec<CompilationIssue> {
    let mut issues = Vec::new();

    if workflow.instructions.is_empty() {
        issues.push(CompilationIssue {
            severity: Severity::Error,
            issue_type: CompilationIssueType::StructuralInvalid,
            instruction_index: 0,
            message: "workflow has no instructions".to_string(),
        });
        return issues;
    }

    for (position, instr) in workflow.instructions.iter().enumerate() {
        if instr.index != position {
            issues.push(CompilationIssue {
                severity: Severity::Error,
                issue_type: CompilationIssueType::StructuralInvalid,
                instruction_index: instr.index,
                message: format!("instruction at position {position} declares index {}, expected {position}", instr.index),
            });
        }
    }

    let mut dest_owners: BTreeMap<&str, usize> = BTreeMap::new();
    for instr in &workflow.instructions {
        let Some(dest) = instr.dest.as_deref() else { continue };
        if let Some(&owner) = dest_owners.get(dest) {
            issues.push(CompilationIssue {
                severity: Severity::Error,
                issue_type: CompilationIssueType::StructuralInvalid,
                instruction_index: instr.index,
                message: format!("register {dest} already written by instruction {owner}; registers are single-writer"),
            });
        } else {
            dest_owners.insert(dest, instr.index);
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp_core::ir::{IrMetadata, Opcode};
    use std::collections::BTreeMap as Map;

    fn meta() -> IrMetadata {
        IrMetadata {
            workflow_id: "wf".into(),
            workflow_version: 1,
        }
    }

    #[test]
    fn empty_workflow_is_structurally_invalid() {
        let workflow = WorkflowDescription { metadata: meta(), instructions: vec![] };
        let issues = validate(&workflow);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, CompilationIssueType::StructuralInvalid);
    }

    #[test]
    fn duplicate_dest_register_is_rejected() {
        let workflow = WorkflowDescription {
            metadata: meta(),
            instructions: vec![
                crate::IntakeInstruction {
                    index: 0,
                    opcode: Opcode::Transform { expression: "noop".into(), params: Map::new() },
                    dest: Some("a".into()),
                    src: vec![],
                },
                crate::IntakeInstruction {
                    index: 1,
                    opcode: Opcode::Transform { expression: "noop".into(), params: Map::new() },
                    dest: Some("a".into()),
                    src: vec![],
                },
            ],
        };
        let issues = validate(&workflow);
        assert!(issues.iter().any(|i| i.issue_type == CompilationIssueType::StructuralInvalid));
    }

    #[test]
    fn misordered_index_is_rejected() {
        let workflow = WorkflowDescription {
            metadata: meta(),
            instructions: vec![crate::IntakeInstruction {
                index: 5,
                opcode: Opcode::Transform { expression: "noop".into(), params: Map::new() },
                dest: None,
                src: vec![],
            }],
        };
        let issues = validate(&workflow);
        assert_eq!(issues.len(), 1);
    }
}
