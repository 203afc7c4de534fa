//! Stage 5: dependency-graph construction, topological sort, and cycle
//! detection.

use std::collections::{BTreeMap, VecDeque};

use scp_core::error::{CompilationIssue, CompilationIssueType, Severity};

use crate::WorkflowDescription;

pub(crate) fn build(
    workflow: &WorkflowDescription,
) -> (BTreeMap<usize, Vec<usize>>, Vec<usize>, Vec<CompilationIssue>) {
    let producer_of: BTreeMap<&str, usize> = workflow
        .instructions
        .iter()
        .filter_map(|i| i.dest.as_deref().map(|d| (d, i.index)))
        .collect();

    let mut dependency_graph: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for instr in &workflow.instructions {
        let mut preds: Vec<usize> = instr
            .src
            .iter()
            .filter_map(|r| producer_of.get(r.as_str()).copied())
            .filter(|&p| p != instr.index)
            .collect();
        preds.sort_unstable();
        preds.dedup();
        dependency_graph.insert(instr.index, preds);
    }

    match topological_sort(&dependency_graph) {
        Some(order) => (dependency_graph, order, vec![]),
        None => {
            let issue = CompilationIssue {
                severity: Severity::Error,
                issue_type: CompilationIssueType::DependencyCycle,
                instruction_index: 0,
                message: "dependency graph contains a cycle".to_string(),
            };
            (dependency_graph, vec![], vec![issue])
        }
    }
}

/// Kahn's algorithm over `predecessors: node -> [preds]`. Returns `None`
/// if a cycle prevents every node from being ordered.
fn topological_sort(predecessors: &BTreeMap<usize, Vec<usize>>) -> Option<Vec<usize>> {
    let mut successors: BTreeMap<usize, Vec<usize>> = predecessors.keys().map(|&n| (n, Vec::new())).collect();
    let mut in_degree: BTreeMap<usize, usize> = predecessors.keys().map(|&n| (n, 0)).collect();

    for (&node, preds) in predecessors {
        *in_degree.get_mut(&node).unwrap() = preds.len();
        for &pred in preds {
            successors.entry(pred).or_default().push(node);
        }
    }

    let mut ready: Vec<usize> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&n, _)| n)
        .collect();
    ready.sort_unstable();
    let mut queue: VecDeque<usize> = ready.into();

    let mut order = Vec::with_capacity(predecessors.len());
    while let Some(node) = queue.pop_front() {
        order.push(node);
        let mut newly_ready = Vec::new();
        if let Some(succs) = successors.get(&node) {
            for &succ in succs {
                let deg = in_degree.get_mut(&succ).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(succ);
                }
            }
        }
        newly_ready.sort_unstable();
        for n in newly_ready {
            queue.push_back(n);
        }
    }

    if order.len() == predecessors.len() {
        Some(order)
    } else {
        None
    }
}
