//! Offline buffer (spec.md §4.9 "Offline buffer"): when the central SVM
//! cannot reach a remote node, the dispatcher's failure causes the VM to
//! enqueue the slice request durably rather than drop it, resuming only
//! when connectivity is restored. The storage medium is left open by
//! the spec (§9 open questions); this crate keeps it append-only and
//! in-process, which a deployment backs with durable local storage
//! without changing this type's contract.

use std::collections::VecDeque;
use std::sync::RwLock;

use scp_dispatcher::SliceDispatchPayload;

/// One buffered slice dispatch awaiting a reachable node.
#[derive(Debug, Clone)]
pub struct BufferedDispatch {
    /// The node the slice was destined for.
    pub node_id: String,
    /// The slice payload, ready to resend unchanged.
    pub payload: SliceDispatchPayload,
}

/// Append-only queue of dispatches deferred because their target node
/// was unreachable.
#[derive(Default)]
pub struct OfflineBuffer {
    pending: RwLock<VecDeque<BufferedDispatch>>,
}

impl OfflineBuffer {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Durably enqueue a dispatch that could not be delivered.
    pub fn enqueue(&self, node_id: &str, payload: SliceDispatchPayload) {
        tracing::warn!(node_id, slice_id = %payload.slice_id, "buffering slice dispatch, node unreachable");
        self.pending.write().expect("offline buffer lock poisoned").push_back(BufferedDispatch {
            node_id: node_id.to_string(),
            payload,
        });
    }

    /// Number of dispatches currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.read().expect("offline buffer lock poisoned").len()
    }

    /// `true` if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every dispatch currently buffered for `node_id`, in FIFO
    /// order, for the caller to resend now that connectivity is
    /// restored.
    pub fn drain_for_node(&self, node_id: &str) -> Vec<BufferedDispatch> {
        let mut pending = self.pending.write().expect("offline buffer lock poisoned");
        let (matching, rest): (VecDeque<_>, VecDeque<_>) =
            pending.drain(..).partition(|entry| entry.node_id == node_id);
        *pending = rest;
        matching.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn payload(slice_id: &str) -> SliceDispatchPayload {
        SliceDispatchPayload {
            plan_id: "plan-1".into(),
            slice_id: slice_id.into(),
            instructions: vec![],
            instruction_order: vec![],
            register_values: BTreeMap::new(),
            timeout_ms: 1000,
            checksum: "deadbeef".into(),
        }
    }

    #[test]
    fn drain_returns_only_the_matching_node_in_order() {
        let buffer = OfflineBuffer::new();
        buffer.enqueue("edge-a", payload("slice-1"));
        buffer.enqueue("edge-b", payload("slice-2"));
        buffer.enqueue("edge-a", payload("slice-3"));

        assert_eq!(buffer.len(), 3);
        let drained = buffer.drain_for_node("edge-a");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload.slice_id, "slice-1");
        assert_eq!(drained[1].payload.slice_id, "slice-3");
        assert_eq!(buffer.len(), 1);
        assert!(buffer.drain_for_node("edge-a").is_empty());
    }
}
