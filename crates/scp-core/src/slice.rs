// Execution slices, sync points, and cross-node data flows produced by
// the distribution planner (stage 9) and consumed by the dispatcher and
// SVM.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ir::{IrInstruction, OnTimeout, Register};
use crate::node::CENTRAL_NODE_ID;

/// Reserved slice id for the slice that lands on the central node.
pub const CENTRAL_SLICE_ID: &str = "central";

/// Where a slice-local register's value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum InputBinding {
    /// Produced by another slice.
    FromSlice {
        /// Producing slice id.
        from_slice_id: String,
        /// Register name in the producing slice.
        from_register: Register,
    },
    /// Bound directly from a fired trigger event.
    FromTrigger {
        /// Always `true`; present to make the tag explicit on the wire.
        from_trigger: bool,
    },
}

/// An outbound register binding: this slice writes `register`, and it
/// must be shipped to `target_slice_id` as `target_register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputBinding {
    /// Local register name.
    pub register: Register,
    /// Destination slice id.
    pub target_slice_id: String,
    /// Register name in the destination slice.
    pub target_register: Register,
}

/// A contiguous instruction subsequence assigned to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionSlice {
    /// Unique slice id. The root slice is always `"central"`.
    pub slice_id: String,
    /// The node this slice is assigned to.
    pub node_id: String,
    /// The instructions belonging to this slice.
    pub instructions: Vec<IrInstruction>,
    /// Topological order over `instructions`, by original index.
    pub instruction_order: Vec<usize>,
    /// Registers this slice expects to receive before it can run.
    pub input_bindings: BTreeMap<Register, InputBinding>,
    /// Registers this slice must ship out once it completes.
    pub output_bindings: Vec<OutputBinding>,
    /// `true` for the slice assigned to the central node's root scope.
    pub is_root: bool,
    /// Other slices this slice's inputs depend on.
    pub depends_on_slices: Vec<String>,
    /// Sum of `estimated_duration_ms` across this slice's instructions.
    pub estimated_duration_ms: u64,
    /// SHA-256 of the canonical-JSON serialization of `instructions`.
    pub checksum: String,
}

impl ExecutionSlice {
    /// `true` if this is the reserved central root slice.
    #[must_use]
    pub fn is_central(&self) -> bool {
        self.slice_id == CENTRAL_SLICE_ID && self.node_id == CENTRAL_NODE_ID
    }

    /// Recompute the checksum over `instructions` and compare to
    /// `self.checksum`.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        compute_slice_checksum(&self.instructions) == self.checksum
    }
}

/// Compute the canonical checksum for a slice's instruction array.
#[must_use]
pub fn compute_slice_checksum(instructions: &[IrInstruction]) -> String {
    let bytes = crate::canonical_json(instructions).unwrap_or_default();
    crate::sha256_hex(&bytes)
}

/// A barrier where the central SVM waits for one or more remote slices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SyncPoint {
    /// Unique sync point id.
    pub sync_id: String,
    /// Central instruction index to pause before.
    pub pause_before_instruction: usize,
    /// Remote slices this sync point waits on.
    pub await_slice_ids: Vec<String>,
    /// Cross-node flows this sync point is responsible for realizing.
    pub inbound_flows: Vec<CrossNodeDataFlow>,
    /// Central instruction index to resume at once satisfied.
    pub resume_at_instruction: usize,
    /// Wall-clock timeout in milliseconds.
    pub timeout_ms: u64,
    /// What to do if the timeout elapses.
    pub on_timeout: OnTimeout,
    /// Default value to use when `on_timeout == UseDefault`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

/// Default slice-timeout policy: `3 * estimated_duration_ms + 2000`.
#[must_use]
pub fn default_sync_timeout_ms(estimated_duration_ms: u64) -> u64 {
    3 * estimated_duration_ms + 2000
}

/// A register read in one slice whose producer lives in another slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CrossNodeDataFlow {
    /// Unique flow id.
    pub flow_id: String,
    /// Producing node id.
    pub from_node_id: String,
    /// Producing register name.
    pub from_register: Register,
    /// Consuming node id.
    pub to_node_id: String,
    /// Consuming register name.
    pub to_register: Register,
    /// Optional JSON-Schema-subset payload shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_schema: Option<serde_json::Value>,
}

/// The full output of the distribution planner (stage 9): every slice,
/// every cross-node flow, every sync point, and the critical-path
/// estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DistributionPlan {
    /// All slices, keyed by slice id.
    pub slices: BTreeMap<String, ExecutionSlice>,
    /// All cross-node data flows (duplicates collapsed).
    pub cross_node_flows: Vec<CrossNodeDataFlow>,
    /// All sync points, in ascending `pause_before_instruction` order.
    pub sync_points: Vec<SyncPoint>,
    /// Estimated critical-path duration in milliseconds, including fixed
    /// per-remote-node RTT.
    pub critical_path_ms: u64,
    /// `false` only when every slice collapsed onto the central node
    /// (every edge node was offline at plan time).
    pub is_distributed: bool,
}

impl DistributionPlan {
    /// `true` if every cross-node read is covered by exactly one
    /// [`CrossNodeDataFlow`] and every sync point's awaited slices target
    /// a non-central node, per the §8 universal invariants.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        for sp in &self.sync_points {
            for slice_id in &sp.await_slice_ids {
                match self.slices.get(slice_id) {
                    Some(slice) if slice.node_id != CENTRAL_NODE_ID => {}
                    _ => return false,
                }
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for flow in &self.cross_node_flows {
            let key = (
                flow.from_node_id.clone(),
                flow.from_register.clone(),
                flow.to_node_id.clone(),
                flow.to_register.clone(),
            );
            if !seen.insert(key) {
                return false;
            }
        }
        true
    }
}
