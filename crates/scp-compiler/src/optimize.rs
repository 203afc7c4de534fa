//! Stage 8: optimization passes — dead-code elimination, common
//! subexpression detection, and admission checks. None of these remove
//! an instruction (the pipeline never drops one); findings surface as
//! warnings for the caller or a later tooling pass to act on.

use std::collections::{BTreeMap, BTreeSet};

use scp_core::error::{CompilationIssue, CompilationIssueType, Severity};
use scp_core::ir::IrInstruction;

/// Dispatch timeouts above this are flagged for operator review rather
/// than silently admitted.
const ADMISSION_TIMEOUT_CEILING_MS: u64 = 120_000;

pub(crate) fn analyze(
    instructions: &[IrInstruction],
    dependency_graph: &BTreeMap<usize, Vec<usize>>,
) -> Vec<CompilationIssue> {
    let mut warnings = Vec::new();
    warnings.extend(dead_code(instructions, dependency_graph));
    warnings.extend(common_subexpressions(instructions));
    warnings.extend(admission_checks(instructions));
    warnings
}

fn dead_code(instructions: &[IrInstruction], dependency_graph: &BTreeMap<usize, Vec<usize>>) -> Vec<CompilationIssue> {
    let referenced: BTreeSet<usize> = dependency_graph.values().flatten().copied().collect();
    instructions
        .iter()
        .filter(|instr| {
            instr.dest.is_some() && instr.opcode.is_pure() && !referenced.contains(&instr.index)
        })
        .map(|instr| CompilationIssue {
            severity: Severity::Warning,
            issue_type: CompilationIssueType::StructuralInvalid,
            instruction_index: instr.index,
            message: format!("register {} is never read (dead code)", instr.dest.as_deref().unwrap_or("?")),
        })
        .collect()
}

fn common_subexpressions(instructions: &[IrInstruction]) -> Vec<CompilationIssue> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut warnings = Vec::new();
    for instr in instructions {
        if !instr.opcode.is_pure() {
            continue;
        }
        let Ok(fingerprint) = scp_core::canonical_json(&(&instr.opcode, &instr.src)) else { continue };
        let key = String::from_utf8_lossy(&fingerprint).to_string();
        if let Some(&original) = seen.get(&key) {
            warnings.push(CompilationIssue {
                severity: Severity::Warning,
                issue_type: CompilationIssueType::StructuralInvalid,
                instruction_index: instr.index,
                message: format!("duplicates pure computation of instruction {original}; candidate for common-subexpression merging"),
            });
        } else {
            seen.insert(key, instr.index);
        }
    }
    warnings
}

fn admission_checks(instructions: &[IrInstruction]) -> Vec<CompilationIssue> {
    instructions
        .iter()
        .filter_map(|instr| {
            let metadata = instr.dispatch_metadata.as_ref()?;
            (metadata.timeout_ms > ADMISSION_TIMEOUT_CEILING_MS).then(|| CompilationIssue {
                severity: Severity::Warning,
                issue_type: CompilationIssueType::ServiceResolutionFailed,
                instruction_index: instr.index,
                message: format!("dispatch timeout {}ms exceeds admission ceiling {ADMISSION_TIMEOUT_CEILING_MS}ms", metadata.timeout_ms),
            })
        })
        .collect()
}
