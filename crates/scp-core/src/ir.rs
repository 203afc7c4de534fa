// LLM-IR: the register-based, SSA-like bytecode produced by compilation.
// Opcodes are tagged variants with exhaustive pattern matching (§9 Design
// Notes: "dynamic typing of IR operands" is rejected in favor of this).
// An unrecognized opcode tag is a hard `serde` decode error, never a
// runtime value.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A register name within one execution slice. Registers are
/// single-writer (SSA-like): at most one instruction in a slice may
/// declare a given register as its `dest`.
pub type Register = String;

/// Policy for what to do when a remote slice's result is missing at a
/// sync point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnTimeout {
    /// Abort the workflow.
    Fail,
    /// Proceed without binding the register.
    Skip,
    /// Populate the register with a caller-supplied default value.
    UseDefault,
}

/// Dispatch metadata attached to a service-invoking instruction during
/// stage 7 (service resolution).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DispatchMetadata {
    /// The executable format this instruction will run under.
    pub format: crate::node::ServiceFormat,
    /// Executor deadline in milliseconds.
    pub timeout_ms: u64,
    /// WASM linear memory requirement, if `format == WASM`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wasm_memory_mb: Option<u64>,
    /// Connector sub-type, if `format == CONNECTOR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_type: Option<String>,
}

/// The opcode and its operand payload for one IR instruction. Every
/// opcode named in spec.md §3 has exactly one variant here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "opcode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    /// Bind a driver-fired event to a register; the root of a workflow.
    Trigger {
        /// The trigger driver id (e.g. `"cron"`, `"mqtt"`).
        driver_id: String,
        /// Driver-specific configuration blob.
        config: serde_json::Value,
        /// Vault path for driver credentials, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials_vault_path: Option<String>,
        /// Debounce window in milliseconds; 0 disables debounce.
        #[serde(default)]
        debounce_ms: u64,
    },
    /// Invoke a catalog `service` capability.
    CallService {
        /// Catalog capability id.
        capability_id: String,
        /// Named operand bindings (literal values or register refs
        /// resolved via `src`).
        operands: BTreeMap<String, serde_json::Value>,
    },
    /// Invoke a catalog `action` capability.
    CallAction {
        /// Catalog capability id.
        capability_id: String,
        /// Named operand bindings.
        operands: BTreeMap<String, serde_json::Value>,
    },
    /// Apply a pure data transform expression to `src` registers.
    Transform {
        /// Transform expression identifier (e.g. `"multiply"`, `"concat"`).
        expression: String,
        /// Expression parameters.
        params: BTreeMap<String, serde_json::Value>,
    },
    /// Keep or drop a value based on a predicate.
    Filter {
        /// Predicate expression (e.g. `"gt"`, `"eq"`).
        predicate: String,
        /// Predicate parameters.
        params: BTreeMap<String, serde_json::Value>,
    },
    /// Reduce multiple `src` registers into one value.
    Aggregate {
        /// Aggregation function (e.g. `"sum"`, `"concat"`, `"collect"`).
        function: String,
    },
    /// Validate a value's shape, aborting the instruction on failure.
    Validate {
        /// JSON Schema (subset) to validate against.
        schema: serde_json::Value,
    },
    /// Load a named resource (file, secret, lookup table) into a register.
    LoadResource {
        /// Resource locator.
        uri: String,
    },
    /// Persist a value into workflow-scoped memory, keyed by name.
    StoreMemory {
        /// Memory key.
        key: String,
    },
    /// Fan out into N child logical threads, one per `parallelGroupId`
    /// member.
    ParallelSpawn {
        /// The parallel group being spawned.
        group_id: String,
        /// `true` if one child's failure should abort the whole group.
        strict: bool,
    },
    /// Edge-local finite-state-machine step that may emit a propagated
    /// event toward central.
    EventStateMachine {
        /// Compile-time target node for this FSM instance.
        target_node_id: String,
        /// FSM definition identifier.
        machine_id: String,
    },
    /// Receive an event propagated from an edge FSM. Always runs on
    /// central.
    HandlePropagated {
        /// Identifier of the originating FSM instance.
        machine_id: String,
    },
    /// Issue a command to a specific remote node. Always runs on central.
    RemoteCommand {
        /// Target node id.
        target_node_id: String,
        /// Command payload.
        command: serde_json::Value,
    },
    /// Handle a command received from central on a remote node.
    HandleRemoteCmd {
        /// Compile-time target node for this handler.
        target_node_id: String,
    },
}

impl Opcode {
    /// The opcode's discriminant name, for logging and error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Trigger { .. } => "TRIGGER",
            Opcode::CallService { .. } => "CALL_SERVICE",
            Opcode::CallAction { .. } => "CALL_ACTION",
            Opcode::Transform { .. } => "TRANSFORM",
            Opcode::Filter { .. } => "FILTER",
            Opcode::Aggregate { .. } => "AGGREGATE",
            Opcode::Validate { .. } => "VALIDATE",
            Opcode::LoadResource { .. } => "LOAD_RESOURCE",
            Opcode::StoreMemory { .. } => "STORE_MEMORY",
            Opcode::ParallelSpawn { .. } => "PARALLEL_SPAWN",
            Opcode::EventStateMachine { .. } => "EVENT_STATE_MACHINE",
            Opcode::HandlePropagated { .. } => "HANDLE_PROPAGATED",
            Opcode::RemoteCommand { .. } => "REMOTE_COMMAND",
            Opcode::HandleRemoteCmd { .. } => "HANDLE_REMOTE_CMD",
        }
    }

    /// `true` for opcodes whose result depends only on `src` registers
    /// (no side effects): eligible for stage-4 constant folding and
    /// stage-8 common-subexpression merging.
    #[must_use]
    pub fn is_pure(&self) -> bool {
        matches!(self, Opcode::Transform { .. } | Opcode::Filter { .. } | Opcode::Aggregate { .. })
    }
}

/// One instruction in an LLM-IR program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IrInstruction {
    /// Position within the original (pre-distribution) instruction array.
    pub index: usize,
    /// The opcode and its operands.
    pub opcode: Opcode,
    /// The register this instruction writes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<Register>,
    /// Registers this instruction reads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src: Vec<Register>,
    /// Shared id for instructions inferred parallel-safe by stage 6.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group_id: Option<String>,
    /// Attached by stage 7 for service-invoking instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_metadata: Option<DispatchMetadata>,
    /// Attached by the distribution planner (stage 9).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    /// Attached by the distribution planner (stage 9).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_id: Option<String>,
    /// Catalog capability ids this instruction needs resolved and
    /// non-revoked before it may execute.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
}

/// Workflow-level metadata carried alongside a [`ResolvedIr`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IrMetadata {
    /// Workflow identifier.
    pub workflow_id: String,
    /// Monotone workflow version.
    pub workflow_version: u64,
}

/// The output of the compilation pipeline (stages 1–8): IR annotated
/// with a dependency graph, a topological instruction order, and
/// resolved metadata. Stage 9 (the distribution planner) further
/// annotates each instruction's `target_node_id`/`slice_id` and attaches
/// a [`crate::slice::DistributionPlan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResolvedIr {
    /// The instructions, in original program order (index-addressable).
    pub instructions: Vec<IrInstruction>,
    /// `index -> [predecessor indices]`, built from `src` register
    /// producers.
    pub dependency_graph: BTreeMap<usize, Vec<usize>>,
    /// A valid topological order over `instructions`.
    pub instruction_order: Vec<usize>,
    /// Workflow identity.
    pub metadata: IrMetadata,
    /// Present once the distribution planner (stage 9) has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_plan: Option<crate::slice::DistributionPlan>,
}

impl ResolvedIr {
    /// Look up an instruction by its original index.
    #[must_use]
    pub fn instruction(&self, index: usize) -> Option<&IrInstruction> {
        self.instructions.iter().find(|i| i.index == index)
    }

    /// `true` if `instruction_order` is a valid topological order over
    /// `dependency_graph`: every predecessor of an instruction appears
    /// before it.
    #[must_use]
    pub fn has_valid_topological_order(&self) -> bool {
        let mut position = BTreeMap::new();
        for (pos, idx) in self.instruction_order.iter().enumerate() {
            position.insert(*idx, pos);
        }
        if position.len() != self.instructions.len() {
            return false;
        }
        for (idx, preds) in &self.dependency_graph {
            let Some(&idx_pos) = position.get(idx) else {
                return false;
            };
            for pred in preds {
                match position.get(pred) {
                    Some(&pred_pos) if pred_pos < idx_pos => {}
                    _ => return false,
                }
            }
        }
        true
    }

    /// `true` if the dependency graph is acyclic (a DFS-based check,
    /// independent of whether an `instruction_order` was ever computed).
    #[must_use]
    pub fn is_acyclic(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks: BTreeMap<usize, Mark> =
            self.dependency_graph.keys().map(|k| (*k, Mark::Unvisited)).collect();
        for instr in &self.instructions {
            marks.entry(instr.index).or_insert(Mark::Unvisited);
        }

        fn visit(
            node: usize,
            graph: &BTreeMap<usize, Vec<usize>>,
            marks: &mut BTreeMap<usize, Mark>,
        ) -> bool {
            match marks.get(&node).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return true,
                Mark::InProgress => return false,
                Mark::Unvisited => {}
            }
            marks.insert(node, Mark::InProgress);
            if let Some(preds) = graph.get(&node) {
                for &pred in preds {
                    if !visit(pred, graph, marks) {
                        return false;
                    }
                }
            }
            marks.insert(node, Mark::Done);
            true
        }

        let nodes: Vec<usize> = marks.keys().copied().collect();
        for node in nodes {
            if !visit(node, &self.dependency_graph, &mut marks) {
                return false;
            }
        }
        true
    }
}
