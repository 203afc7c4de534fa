//! Stage 6: parallel-group inference.
//!
//! Instructions with no mutual dependency and no ordered side-effect
//! marker may share a `parallelGroupId`. We approximate "no mutual
//! dependency" with dependency-graph layering: two instructions at the
//! same layer (same longest-path distance from a root) have no path
//! between them. "No ordered side-effect marker" is approximated with
//! `Opcode::is_pure`.

use std::collections::BTreeMap;

use scp_core::ir::Register;

use crate::WorkflowDescription;

pub(crate) fn infer_groups(
    workflow: &WorkflowDescription,
    dependency_graph: &BTreeMap<usize, Vec<usize>>,
    instruction_order: &[usize],
) -> BTreeMap<usize, Register> {
    if instruction_order.is_empty() {
        return BTreeMap::new();
    }

    let mut layer: BTreeMap<usize, usize> = BTreeMap::new();
    for &index in instruction_order {
        let preds = dependency_graph.get(&index).map(Vec::as_slice).unwrap_or(&[]);
        let depth = preds.iter().map(|p| layer.get(p).copied().unwrap_or(0) + 1).max().unwrap_or(0);
        layer.insert(index, depth);
    }

    let is_pure: BTreeMap<usize, bool> = workflow
        .instructions
        .iter()
        .map(|i| (i.index, i.opcode.is_pure()))
        .collect();

    let mut by_layer: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (&index, &depth) in &layer {
        if is_pure.get(&index).copied().unwrap_or(false) {
            by_layer.entry(depth).or_default().push(index);
        }
    }

    let mut groups = BTreeMap::new();
    for (depth, members) in by_layer {
        if members.len() < 2 {
            continue;
        }
        let group_id = format!("pg-{depth}");
        for index in members {
            groups.insert(index, group_id.clone());
        }
    }
    groups
}
