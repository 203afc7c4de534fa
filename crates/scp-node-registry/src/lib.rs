#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-node-registry
//!
//! The Node Registry (component C2): a directory of known nodes with
//! capability-based best-fit selection, heartbeat tracking, and
//! offline-cascade bookkeeping.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use scp_core::node::{NodeCapability, NodeRequirement, NodeStatus, CENTRAL_NODE_ID};

/// A heartbeat is considered missed once this many multiples of the
/// expected interval have elapsed without one, per spec.md §4.2.
pub const OFFLINE_MISSED_INTERVAL_MULTIPLIER: i64 = 3;

/// Directory of known nodes, with best-fit selection and heartbeat
/// tracking.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<String, NodeCapability>>,
    expected_heartbeat_interval: ChronoDuration,
}

impl NodeRegistry {
    /// Create a registry seeded only with the always-present central
    /// node, expecting heartbeats at `expected_heartbeat_interval_secs`.
    #[must_use]
    pub fn new(now: DateTime<Utc>, expected_heartbeat_interval_secs: i64) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(CENTRAL_NODE_ID.to_string(), NodeCapability::central(now));
        Self {
            nodes: RwLock::new(nodes),
            expected_heartbeat_interval: ChronoDuration::seconds(expected_heartbeat_interval_secs),
        }
    }

    /// Register or replace a node's declared capability profile.
    pub fn register(&self, node: NodeCapability) {
        tracing::info!(node_id = %node.node_id, tier = ?node.tier, "node registered");
        self.nodes.write().expect("registry lock poisoned").insert(node.node_id.clone(), node);
    }

    /// Remove a node entirely (used for decommissioning, not for
    /// transient offline states — see [`NodeRegistry::record_heartbeat`]).
    pub fn deregister(&self, node_id: &str) {
        self.nodes.write().expect("registry lock poisoned").remove(node_id);
    }

    /// Current snapshot of a single node.
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<NodeCapability> {
        self.nodes.read().expect("registry lock poisoned").get(node_id).cloned()
    }

    /// Snapshot of every known node, in id order.
    #[must_use]
    pub fn all(&self) -> Vec<NodeCapability> {
        self.nodes.read().expect("registry lock poisoned").values().cloned().collect()
    }

    /// Record a heartbeat: updates `last_seen_at`, `status`, and
    /// `latency_to_central_ms` for the named node. No-op if the node is
    /// unknown.
    pub fn record_heartbeat(&self, node_id: &str, now: DateTime<Utc>, status: NodeStatus, latency_ms: u64) {
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        if let Some(node) = nodes.get_mut(node_id) {
            node.last_seen_at = now;
            node.status = status;
            node.latency_to_central_ms = latency_ms;
        }
    }

    /// Sweep for nodes whose heartbeat has lapsed by more than
    /// [`OFFLINE_MISSED_INTERVAL_MULTIPLIER`] times the expected
    /// interval; transition them to `OFFLINE` and return their ids so
    /// the caller can cascade a purge of their remote-declared trigger
    /// drivers (spec.md §4.2/§4.3).
    pub fn sweep_offline(&self, now: DateTime<Utc>) -> Vec<String> {
        let threshold = self.expected_heartbeat_interval * OFFLINE_MISSED_INTERVAL_MULTIPLIER as i32;
        let mut newly_offline = Vec::new();
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        for node in nodes.values_mut() {
            if node.node_id == CENTRAL_NODE_ID {
                continue;
            }
            if node.status != NodeStatus::Offline && now - node.last_seen_at > threshold {
                node.status = NodeStatus::Offline;
                newly_offline.push(node.node_id.clone());
                tracing::warn!(node_id = %node.node_id, "node missed heartbeat, marked offline");
            }
        }
        newly_offline
    }

    /// [`NodeRegistry::sweep_offline`] followed by cascading a purge of
    /// each newly-offline node's remote-declared trigger drivers out of
    /// `trigger_registry`, the single step spec.md §4.2/§4.3 describes
    /// as one behavior: a missed heartbeat both marks the node OFFLINE
    /// and retires the trigger proxies it declared, so planning never
    /// routes a new `TRIGGER` to a node that is no longer there.
    pub fn sweep_offline_and_purge_triggers(
        &self,
        trigger_registry: &scp_trigger::TriggerDriverRegistry,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let newly_offline = self.sweep_offline(now);
        for node_id in &newly_offline {
            trigger_registry.purge_node(node_id);
        }
        newly_offline
    }

    /// Best-fit node selection per spec.md §4.2: an explicit
    /// `forced_node_id` bypasses matching entirely (even if that node
    /// would otherwise fail `satisfies`). Otherwise, rank all
    /// `satisfies`-eligible nodes by preferred-tier match, then lower
    /// `latency_to_central_ms`, then earlier `last_seen_at`. If none
    /// qualify, fall back to `CENTRAL`.
    #[must_use]
    pub fn select(&self, req: &NodeRequirement) -> NodeCapability {
        let nodes = self.nodes.read().expect("registry lock poisoned");

        if let Some(forced) = &req.forced_node_id {
            if let Some(node) = nodes.get(forced) {
                return node.clone();
            }
        }

        let mut candidates: Vec<&NodeCapability> =
            nodes.values().filter(|n| n.satisfies(req)).collect();

        candidates.sort_by(|a, b| {
            let a_pref = tier_match_rank(a, req.preferred_tier.as_ref());
            let b_pref = tier_match_rank(b, req.preferred_tier.as_ref());
            a_pref
                .cmp(&b_pref)
                .then_with(|| a.latency_to_central_ms.cmp(&b.latency_to_central_ms))
                .then_with(|| a.last_seen_at.cmp(&b.last_seen_at))
        });

        candidates
            .into_iter()
            .next()
            .cloned()
            .unwrap_or_else(|| {
                nodes
                    .get(CENTRAL_NODE_ID)
                    .cloned()
                    .expect("central node is always registered")
            })
    }
}

fn tier_match_rank(node: &NodeCapability, preferred: Option<&scp_core::node::NodeTier>) -> u8 {
    match preferred {
        Some(tier) if node.tier == *tier => 0,
        Some(_) => 1,
        None => 0,
    }
}
