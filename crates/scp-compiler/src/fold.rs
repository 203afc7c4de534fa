//! Stage 4: constant folding on pure `TRANSFORM`s with no register
//! operands.

use std::collections::BTreeMap;

use scp_core::ir::{Opcode, Register};

use crate::WorkflowDescription;

pub(crate) fn fold_constants(workflow: &WorkflowDescription) -> BTreeMap<Register, serde_json::Value> {
    let mut constants = BTreeMap::new();

    for instr in &workflow.instructions {
        let Some(dest) = &instr.dest else { continue };
        if !instr.src.is_empty() {
            continue;
        }
        let Opcode::Transform { expression, params } = &instr.opcode else { continue };
        if let Some(value) = evaluate(expression, params) {
            constants.insert(dest.clone(), value);
        }
    }

    constants
}

fn evaluate(expression: &str, params: &BTreeMap<String, serde_json::Value>) -> Option<serde_json::Value> {
    match expression {
        "literal" => params.get("value").cloned(),
        "add" => {
            let mut total = 0.0_f64;
            for value in params.values() {
                total += value.as_f64()?;
            }
            Some(serde_json::json!(total))
        }
        "concat" => {
            let mut out = String::new();
            for value in params.values() {
                out.push_str(value.as_str()?);
            }
            Some(serde_json::json!(out))
        }
        _ => None,
    }
}
