#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-planner
//!
//! The Distribution Planner (component C5, stage 9): assigns every
//! instruction of a [`ResolvedIr`] to a node, slices the program along
//! node boundaries, computes cross-node data flows and sync points, and
//! estimates the critical path.

mod requirement;

use std::collections::{BTreeMap, BTreeSet};

use scp_core::ir::{OnTimeout, Register, ResolvedIr};
use scp_core::node::CENTRAL_NODE_ID;
use scp_core::slice::{
    compute_slice_checksum, default_sync_timeout_ms, CrossNodeDataFlow, DistributionPlan, ExecutionSlice,
    InputBinding, OutputBinding, SyncPoint, CENTRAL_SLICE_ID,
};
use scp_node_registry::NodeRegistry;
use scp_trigger::TriggerDriverRegistry;

/// Fixed round-trip estimate added to the critical path per distinct
/// remote node touched (spec.md §4.5 step 6).
pub const REMOTE_RTT_MS: u64 = 50;

/// An instruction with no dispatch metadata is assumed to cost this
/// much wall-clock time for critical-path purposes.
const DEFAULT_INSTRUCTION_ESTIMATE_MS: u64 = 10;

/// Run stage 9 over `resolved`, producing a new [`ResolvedIr`] with
/// `target_node_id`/`slice_id` annotated on every instruction and a
/// [`DistributionPlan`] attached.
#[must_use]
pub fn plan(resolved: &ResolvedIr, node_registry: &NodeRegistry, trigger_registry: &TriggerDriverRegistry) -> ResolvedIr {
    let assigned_node = assign_nodes(resolved, node_registry, trigger_registry);
    let (slice_id_of, slices_order) = slice_program(resolved, &assigned_node);
    let slices = build_slices(resolved, &assigned_node, &slice_id_of, &slices_order);
    let cross_node_flows = compute_cross_node_flows(resolved, &assigned_node);
    let sync_points = insert_sync_points(resolved, &slices, &cross_node_flows, &assigned_node);
    let critical_path_ms = estimate_critical_path(resolved, &assigned_node);
    let is_distributed = assigned_node.values().any(|n| n != CENTRAL_NODE_ID);

    let mut instructions = resolved.instructions.clone();
    for instr in &mut instructions {
        instr.target_node_id = assigned_node.get(&instr.index).cloned();
        instr.slice_id = slice_id_of.get(&instr.index).cloned();
    }

    let distribution_plan = DistributionPlan {
        slices,
        cross_node_flows,
        sync_points,
        critical_path_ms,
        is_distributed,
    };

    tracing::info!(
        workflow_id = %resolved.metadata.workflow_id,
        slice_count = distribution_plan.slices.len(),
        is_distributed,
        critical_path_ms,
        "distribution plan computed"
    );

    ResolvedIr {
        instructions,
        dependency_graph: resolved.dependency_graph.clone(),
        instruction_order: resolved.instruction_order.clone(),
        metadata: resolved.metadata.clone(),
        distribution_plan: Some(distribution_plan),
    }
}

/// Step 1 + 2: requirement inference and parallel-affinity pinning.
fn assign_nodes(
    resolved: &ResolvedIr,
    node_registry: &NodeRegistry,
    trigger_registry: &TriggerDriverRegistry,
) -> BTreeMap<usize, String> {
    let mut assigned = BTreeMap::new();
    let mut producer_node: BTreeMap<Register, String> = BTreeMap::new();
    let mut group_pin: BTreeMap<String, String> = BTreeMap::new();

    for &index in &resolved.instruction_order {
        let Some(instr) = resolved.instruction(index) else { continue };

        let node = if let Some(group_id) = &instr.parallel_group_id {
            if let Some(pinned) = group_pin.get(group_id) {
                pinned.clone()
            } else {
                let node = resolve_routing(instr, &producer_node, node_registry, trigger_registry);
                group_pin.insert(group_id.clone(), node.clone());
                node
            }
        } else {
            resolve_routing(instr, &producer_node, node_registry, trigger_registry)
        };

        if let Some(dest) = &instr.dest {
            producer_node.insert(dest.clone(), node.clone());
        }
        assigned.insert(index, node);
    }

    assigned
}

fn resolve_routing(
    instr: &scp_core::ir::IrInstruction,
    producer_node: &BTreeMap<Register, String>,
    node_registry: &NodeRegistry,
    trigger_registry: &TriggerDriverRegistry,
) -> String {
    match requirement::infer(instr, producer_node, trigger_registry) {
        requirement::Routing::Fixed(node_id) => node_id,
        requirement::Routing::Ranked(req) => node_registry.select(&req).node_id,
    }
}

/// Step 3: slicing. A new slice starts whenever the assigned node
/// changes or a `PARALLEL_SPAWN` is encountered. Every instruction
/// assigned to the central node joins the single `"central"` slice
/// regardless of how many times control returns to it between remote
/// excursions, since [`scp_svm::central`]'s orchestration loop always
/// looks up exactly one central slice and runs it in segments around
/// sync points.
fn slice_program(resolved: &ResolvedIr, assigned_node: &BTreeMap<usize, String>) -> (BTreeMap<usize, String>, Vec<String>) {
    let mut slice_id_of = BTreeMap::new();
    let mut order = Vec::new();
    let mut current_slice: Option<String> = None;
    let mut current_node: Option<&str> = None;
    let mut next_slice_seq = 0u64;

    for &index in &resolved.instruction_order {
        let Some(instr) = resolved.instruction(index) else { continue };
        let node = assigned_node.get(&index).map(String::as_str).unwrap_or(CENTRAL_NODE_ID);

        let starts_new_slice = current_node != Some(node)
            || matches!(instr.opcode, scp_core::ir::Opcode::ParallelSpawn { .. });

        if starts_new_slice || current_slice.is_none() {
            let id = if node == CENTRAL_NODE_ID {
                CENTRAL_SLICE_ID.to_string()
            } else {
                let id = format!("slice-{next_slice_seq}");
                next_slice_seq += 1;
                id
            };
            order.push(id.clone());
            current_slice = Some(id);
            current_node = Some(node);
        }

        slice_id_of.insert(index, current_slice.clone().expect("slice assigned above"));
    }

    (slice_id_of, order)
}

fn build_slices(
    resolved: &ResolvedIr,
    assigned_node: &BTreeMap<usize, String>,
    slice_id_of: &BTreeMap<usize, String>,
    slices_order: &[String],
) -> BTreeMap<String, ExecutionSlice> {
    let mut slices: BTreeMap<String, ExecutionSlice> = BTreeMap::new();

    for slice_id in slices_order {
        if slices.contains_key(slice_id) {
            continue;
        }
        let member_indices: Vec<usize> = resolved
            .instruction_order
            .iter()
            .copied()
            .filter(|i| slice_id_of.get(i) == Some(slice_id))
            .collect();
        let node_id = member_indices
            .first()
            .and_then(|i| assigned_node.get(i))
            .cloned()
            .unwrap_or_else(|| CENTRAL_NODE_ID.to_string());
        let instructions: Vec<_> = member_indices
            .iter()
            .filter_map(|i| resolved.instruction(*i).cloned())
            .collect();
        let estimated_duration_ms: u64 = instructions
            .iter()
            .map(|i| i.dispatch_metadata.as_ref().map_or(DEFAULT_INSTRUCTION_ESTIMATE_MS, |m| m.timeout_ms / 2))
            .sum();
        let checksum = compute_slice_checksum(&instructions);

        slices.insert(
            slice_id.clone(),
            ExecutionSlice {
                slice_id: slice_id.clone(),
                node_id: node_id.clone(),
                instructions,
                instruction_order: member_indices,
                input_bindings: BTreeMap::new(),
                output_bindings: Vec::new(),
                is_root: slice_id == CENTRAL_SLICE_ID && node_id == CENTRAL_NODE_ID,
                depends_on_slices: Vec::new(),
                estimated_duration_ms,
                checksum,
            },
        );
    }

    populate_bindings(resolved, slice_id_of, &mut slices);
    slices
}

fn populate_bindings(
    resolved: &ResolvedIr,
    slice_id_of: &BTreeMap<usize, String>,
    slices: &mut BTreeMap<String, ExecutionSlice>,
) {
    let producer_slice: BTreeMap<&Register, (usize, &str)> = resolved
        .instructions
        .iter()
        .filter_map(|i| i.dest.as_ref().map(|d| (d, (i.index, slice_id_of.get(&i.index).map(String::as_str).unwrap_or(CENTRAL_SLICE_ID)))))
        .collect();

    let mut depends_on: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut outputs: BTreeMap<String, Vec<OutputBinding>> = BTreeMap::new();
    let mut inputs: BTreeMap<String, BTreeMap<Register, InputBinding>> = BTreeMap::new();

    for instr in &resolved.instructions {
        let Some(consumer_slice) = slice_id_of.get(&instr.index) else { continue };
        for src in &instr.src {
            let Some(&(_, producer_slice_id)) = producer_slice.get(src) else {
                inputs
                    .entry(consumer_slice.clone())
                    .or_default()
                    .insert(src.clone(), InputBinding::FromTrigger { from_trigger: true });
                continue;
            };
            if producer_slice_id == consumer_slice {
                continue;
            }
            depends_on.entry(consumer_slice.clone()).or_default().insert(producer_slice_id.to_string());
            inputs.entry(consumer_slice.clone()).or_default().insert(
                src.clone(),
                InputBinding::FromSlice {
                    from_slice_id: producer_slice_id.to_string(),
                    from_register: src.clone(),
                },
            );
            outputs.entry(producer_slice_id.to_string()).or_default().push(OutputBinding {
                register: src.clone(),
                target_slice_id: consumer_slice.clone(),
                target_register: src.clone(),
            });
        }
    }

    for (slice_id, slice) in slices.iter_mut() {
        if let Some(deps) = depends_on.get(slice_id) {
            slice.depends_on_slices = deps.iter().cloned().collect();
        }
        if let Some(out) = outputs.get(slice_id) {
            let mut out = out.clone();
            out.sort_by(|a, b| (a.register.as_str(), a.target_slice_id.as_str()).cmp(&(b.register.as_str(), b.target_slice_id.as_str())));
            out.dedup();
            slice.output_bindings = out;
        }
        if let Some(inb) = inputs.get(slice_id) {
            slice.input_bindings = inb.clone();
        }
    }
}

/// Step 4: cross-node flows, deduplicated by endpoint + register.
fn compute_cross_node_flows(resolved: &ResolvedIr, assigned_node: &BTreeMap<usize, String>) -> Vec<CrossNodeDataFlow> {
    let producer_node: BTreeMap<&Register, &str> = resolved
        .instructions
        .iter()
        .filter_map(|i| i.dest.as_ref().map(|d| (d, assigned_node.get(&i.index).map(String::as_str).unwrap_or(CENTRAL_NODE_ID))))
        .collect();

    let mut seen = BTreeSet::new();
    let mut flows = Vec::new();
    let mut next_id = 0u64;

    for instr in &resolved.instructions {
        let to_node = assigned_node.get(&instr.index).map(String::as_str).unwrap_or(CENTRAL_NODE_ID);
        for src in &instr.src {
            let Some(&from_node) = producer_node.get(src) else { continue };
            if from_node == to_node {
                continue;
            }
            let key = (from_node.to_string(), src.clone(), to_node.to_string(), src.clone());
            if !seen.insert(key) {
                continue;
            }
            flows.push(CrossNodeDataFlow {
                flow_id: format!("flow-{next_id}"),
                from_node_id: from_node.to_string(),
                from_register: src.clone(),
                to_node_id: to_node.to_string(),
                to_register: src.clone(),
                payload_schema: None,
            });
            next_id += 1;
        }
    }

    flows
}

/// Step 5: a sync point for every remote slice producing at least one
/// flow consumed by central.
fn insert_sync_points(
    resolved: &ResolvedIr,
    slices: &BTreeMap<String, ExecutionSlice>,
    cross_node_flows: &[CrossNodeDataFlow],
    assigned_node: &BTreeMap<usize, String>,
) -> Vec<SyncPoint> {
    let mut by_source_slice: BTreeMap<String, Vec<CrossNodeDataFlow>> = BTreeMap::new();
    for flow in cross_node_flows {
        if flow.to_node_id != CENTRAL_NODE_ID {
            continue;
        }
        let Some((source_slice_id, _)) = slices
            .iter()
            .find(|(_, s)| s.node_id == flow.from_node_id && s.instructions.iter().any(|i| i.dest.as_deref() == Some(flow.from_register.as_str())))
        else {
            continue;
        };
        by_source_slice.entry(source_slice_id.clone()).or_default().push(flow.clone());
    }

    let mut sync_points = Vec::new();
    for (slice_id, flows) in by_source_slice {
        let Some(slice) = slices.get(&slice_id) else { continue };
        if slice.node_id == CENTRAL_NODE_ID {
            continue;
        }
        let consumer_indices: Vec<usize> = resolved
            .instructions
            .iter()
            .filter(|i| {
                assigned_node.get(&i.index).map(String::as_str) == Some(CENTRAL_NODE_ID)
                    && i.src.iter().any(|s| flows.iter().any(|f| &f.to_register == s))
            })
            .map(|i| i.index)
            .collect();
        let Some(&pause_before) = consumer_indices.iter().min() else { continue };

        sync_points.push(SyncPoint {
            sync_id: format!("sync-{slice_id}"),
            pause_before_instruction: pause_before,
            await_slice_ids: vec![slice_id.clone()],
            inbound_flows: flows,
            resume_at_instruction: pause_before,
            timeout_ms: default_sync_timeout_ms(slice.estimated_duration_ms),
            on_timeout: OnTimeout::Fail,
            default_value: None,
        });
    }

    sync_points.sort_by_key(|sp| sp.pause_before_instruction);
    sync_points
}

/// Step 6: longest-path analysis over the dependency graph using
/// per-instruction estimates, plus a fixed RTT per distinct remote node.
fn estimate_critical_path(resolved: &ResolvedIr, assigned_node: &BTreeMap<usize, String>) -> u64 {
    let estimate_of = |index: usize| -> u64 {
        resolved
            .instruction(index)
            .and_then(|i| i.dispatch_metadata.as_ref())
            .map_or(DEFAULT_INSTRUCTION_ESTIMATE_MS, |m| m.timeout_ms / 2)
    };

    let mut longest: BTreeMap<usize, u64> = BTreeMap::new();
    for &index in &resolved.instruction_order {
        let preds = resolved.dependency_graph.get(&index).map(Vec::as_slice).unwrap_or(&[]);
        let base = preds.iter().map(|p| longest.get(p).copied().unwrap_or(0)).max().unwrap_or(0);
        longest.insert(index, base + estimate_of(index));
    }

    let path_ms = longest.values().copied().max().unwrap_or(0);
    let remote_nodes: BTreeSet<&str> = assigned_node.values().map(String::as_str).filter(|n| *n != CENTRAL_NODE_ID).collect();
    path_ms + REMOTE_RTT_MS * remote_nodes.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use scp_core::ir::{DispatchMetadata, IrInstruction, IrMetadata, Opcode};
    use scp_core::node::{Hardware, NodeCapability, NodeStatus, NodeTier, ServiceFormat};
    use std::collections::BTreeMap as Map;

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn instr(index: usize, opcode: Opcode, dest: Option<&str>, src: &[&str]) -> IrInstruction {
        IrInstruction {
            index,
            opcode,
            dest: dest.map(str::to_string),
            src: src.iter().map(|s| s.to_string()).collect(),
            parallel_group_id: None,
            dispatch_metadata: None,
            target_node_id: None,
            slice_id: None,
            required_capabilities: vec![],
        }
    }

    fn linux_node(id: &str) -> NodeCapability {
        NodeCapability {
            node_id: id.to_string(),
            tier: NodeTier::Linux,
            supported_formats: [ServiceFormat::Http, ServiceFormat::Native].into_iter().collect(),
            supported_protocols: Default::default(),
            supported_connectors: Default::default(),
            supported_trigger_drivers: Default::default(),
            has_internet_access: true,
            has_vault_access: false,
            can_spawn_processes: true,
            hardware: Hardware { memory_mb: 1024, cpu_cores: 2 },
            max_instructions_per_slice: 32,
            status: NodeStatus::Online,
            last_seen_at: now(),
            latency_to_central_ms: 5,
            base_url: Some(format!("http://{id}.local")),
        }
    }

    #[test]
    fn monolithic_workflow_collapses_to_central_slice() {
        let instructions = vec![
            instr(0, Opcode::Trigger { driver_id: "cron".into(), config: serde_json::json!({}), credentials_vault_path: None, debounce_ms: 0 }, Some("evt"), &[]),
            instr(1, Opcode::Transform { expression: "noop".into(), params: Map::new() }, Some("out"), &["evt"]),
        ];
        let resolved = ResolvedIr {
            instructions,
            dependency_graph: BTreeMap::from([(0, vec![]), (1, vec![0])]),
            instruction_order: vec![0, 1],
            metadata: IrMetadata { workflow_id: "wf".into(), workflow_version: 1 },
            distribution_plan: None,
        };
        let node_registry = NodeRegistry::new(now(), 30);
        let trigger_registry = TriggerDriverRegistry::new();
        let planned = plan(&resolved, &node_registry, &trigger_registry);
        let dp = planned.distribution_plan.unwrap();
        assert_eq!(dp.slices.len(), 1);
        assert!(!dp.is_distributed);
        assert!(dp.slices.contains_key(CENTRAL_SLICE_ID));
    }

    #[test]
    fn native_service_prefers_linux_tier_over_lower_latency_central() {
        let mut dm_instr = instr(
            0,
            Opcode::CallService { capability_id: "x".into(), operands: Map::new() },
            Some("r"),
            &[],
        );
        dm_instr.dispatch_metadata = Some(DispatchMetadata { format: ServiceFormat::Native, timeout_ms: 2000, wasm_memory_mb: None, connector_type: None });
        let resolved = ResolvedIr {
            instructions: vec![dm_instr],
            dependency_graph: BTreeMap::from([(0, vec![])]),
            instruction_order: vec![0],
            metadata: IrMetadata { workflow_id: "wf".into(), workflow_version: 1 },
            distribution_plan: None,
        };
        let node_registry = NodeRegistry::new(now(), 30);
        node_registry.register(linux_node("edge-a"));
        let trigger_registry = TriggerDriverRegistry::new();
        let planned = plan(&resolved, &node_registry, &trigger_registry);
        assert_eq!(planned.instructions[0].target_node_id, Some("edge-a".to_string()));
        assert!(planned.distribution_plan.unwrap().is_distributed);
    }

    #[test]
    fn fallback_guarantee_collapses_to_central_when_all_edges_offline() {
        let mut dm_instr = instr(
            0,
            Opcode::CallService { capability_id: "x".into(), operands: Map::new() },
            Some("r"),
            &[],
        );
        dm_instr.dispatch_metadata = Some(DispatchMetadata { format: ServiceFormat::Http, timeout_ms: 2000, wasm_memory_mb: None, connector_type: None });
        let resolved = ResolvedIr {
            instructions: vec![dm_instr],
            dependency_graph: BTreeMap::from([(0, vec![])]),
            instruction_order: vec![0],
            metadata: IrMetadata { workflow_id: "wf".into(), workflow_version: 1 },
            distribution_plan: None,
        };
        let node_registry = NodeRegistry::new(now(), 30);
        let mut offline = linux_node("edge-a");
        offline.status = NodeStatus::Offline;
        node_registry.register(offline);
        let trigger_registry = TriggerDriverRegistry::new();
        let planned = plan(&resolved, &node_registry, &trigger_registry);
        assert_eq!(planned.instructions[0].target_node_id, Some(CENTRAL_NODE_ID.to_string()));
        assert!(!planned.distribution_plan.unwrap().is_distributed);
    }

    #[test]
    fn cross_node_consumer_gets_a_sync_point() {
        let mut remote = instr(0, Opcode::CallService { capability_id: "x".into(), operands: Map::new() }, Some("r"), &[]);
        remote.dispatch_metadata = Some(DispatchMetadata { format: ServiceFormat::Native, timeout_ms: 2000, wasm_memory_mb: None, connector_type: None });
        let central_consumer = instr(1, Opcode::HandlePropagated { machine_id: "m".into() }, Some("stored"), &["r"]);
        let resolved = ResolvedIr {
            instructions: vec![remote, central_consumer],
            dependency_graph: BTreeMap::from([(0, vec![]), (1, vec![0])]),
            instruction_order: vec![0, 1],
            metadata: IrMetadata { workflow_id: "wf".into(), workflow_version: 1 },
            distribution_plan: None,
        };
        let node_registry = NodeRegistry::new(now(), 30);
        node_registry.register(linux_node("edge-a"));
        let trigger_registry = TriggerDriverRegistry::new();
        let planned = plan(&resolved, &node_registry, &trigger_registry);
        let dp = planned.distribution_plan.unwrap();
        assert!(dp.is_well_formed());
        assert_eq!(dp.sync_points.len(), 1);
        assert_eq!(dp.sync_points[0].pause_before_instruction, 1);
    }
}
