#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-dispatcher
//!
//! The Node Dispatcher (component C7): ships a compiled slice to the
//! node it was planned onto and awaits its result, correlating
//! concurrent in-flight requests by `planId:sliceId`. Transport prefers
//! a persistent channel registered for the node; otherwise it falls
//! back to synchronous HTTP against the node's `base_url`. Retry policy
//! is never the dispatcher's concern — the caller (the SVM, acting on a
//! sync point's `on_timeout`) decides what happens next.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use scp_core::audit::AuditEvent;
use scp_core::ir::{IrInstruction, Register};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};

/// Outcome status of a dispatched slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SliceStatus {
    /// The slice ran to completion.
    Success,
    /// The slice executor reported a failure.
    Failed,
    /// No result arrived before the deadline.
    Timeout,
}

/// Sent to a node to run one execution slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceDispatchPayload {
    /// The distribution plan this slice belongs to.
    pub plan_id: String,
    /// The slice being dispatched.
    pub slice_id: String,
    /// The slice's instructions.
    pub instructions: Vec<IrInstruction>,
    /// Topological order over `instructions`.
    pub instruction_order: Vec<usize>,
    /// Register values already resolved by the caller (inbound cross-node
    /// flows and trigger bindings), keyed by register name.
    pub register_values: BTreeMap<Register, Value>,
    /// Deadline the node must respond within.
    pub timeout_ms: u64,
    /// Checksum of `instructions`, to be echoed back for tamper-detection.
    pub checksum: String,
}

/// Returned by a node once a dispatched slice finishes (or is abandoned).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceResultPayload {
    /// The distribution plan this result belongs to.
    pub plan_id: String,
    /// The slice this result is for.
    pub slice_id: String,
    /// The node that produced this result.
    pub node_id: String,
    /// Outcome status.
    pub status: SliceStatus,
    /// Registers the slice wrote, keyed by register name.
    pub output_registers: BTreeMap<Register, Value>,
    /// Wall-clock execution duration in milliseconds.
    pub duration_ms: u64,
    /// Error detail, present when `status != SUCCESS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Audit events produced while executing this slice, for the caller
    /// to append to the workflow's chain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_events: Vec<AuditEvent>,
}

/// Errors the dispatcher itself can raise, independent of the slice's
/// own `status`.
#[derive(Debug, Error, Clone)]
pub enum DispatchError {
    /// No transport is registered for the node and it has no `base_url`.
    #[error("no route to node {0}")]
    NoRoute(String),
    /// The transport-level request failed (connection refused, DNS, etc.)
    #[error("transport error dispatching to {node_id}: {message}")]
    Transport {
        /// The target node id.
        node_id: String,
        /// Underlying error text.
        message: String,
    },
    /// The deadline elapsed with no result.
    #[error("dispatch to {node_id} for {plan_id}:{slice_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// The target node id.
        node_id: String,
        /// The distribution plan id.
        plan_id: String,
        /// The slice id.
        slice_id: String,
        /// The configured deadline.
        timeout_ms: u64,
    },
    /// The node transitioned to OFFLINE while this request was pending.
    #[error("node {0} went offline while a dispatch was pending")]
    NodeWentOffline(String),
    /// The payload's `instructions` no longer hash to its `checksum`,
    /// caught before the slice is handed to a transport for execution.
    #[error("checksum mismatch for dispatched slice: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The checksum recomputed from `instructions`.
        expected: String,
        /// The checksum the payload carried.
        actual: String,
    },
}

/// Recompute `payload.instructions`' checksum and compare it to the one
/// attached at plan time, the way a receiving node must before running
/// an untrusted dispatched slice (spec.md §6's round-trip law).
pub fn verify_payload_checksum(payload: &SliceDispatchPayload) -> Result<(), DispatchError> {
    let expected = scp_core::slice::compute_slice_checksum(&payload.instructions);
    if expected == payload.checksum {
        Ok(())
    } else {
        Err(DispatchError::ChecksumMismatch { expected, actual: payload.checksum.clone() })
    }
}

/// How a slice is physically shipped to a node.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` to `node_id` and return its result, or a transport
    /// error. Callers apply their own timeout around this call; a
    /// transport that never returns looks identical to one that hangs.
    async fn send(&self, node_id: &str, payload: SliceDispatchPayload) -> Result<SliceResultPayload, DispatchError>;
}

/// Synchronous request/response transport against `base_url + "/execute-slice"`.
pub struct HttpTransport {
    client: reqwest::Client,
    base_urls: RwLock<BTreeMap<String, String>>,
}

impl HttpTransport {
    /// An HTTP transport with no nodes registered yet.
    #[must_use]
    pub fn new() -> Self {
        Self { client: reqwest::Client::new(), base_urls: RwLock::new(BTreeMap::new()) }
    }

    /// Register (or replace) a node's base URL.
    pub fn register_node(&self, node_id: &str, base_url: &str) {
        self.base_urls.write().expect("lock poisoned").insert(node_id.to_string(), base_url.to_string());
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, node_id: &str, payload: SliceDispatchPayload) -> Result<SliceResultPayload, DispatchError> {
        let base_url = self
            .base_urls
            .read()
            .expect("lock poisoned")
            .get(node_id)
            .cloned()
            .ok_or_else(|| DispatchError::NoRoute(node_id.to_string()))?;

        let url = format!("{base_url}/execute-slice");
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DispatchError::Transport { node_id: node_id.to_string(), message: e.to_string() })?;

        response
            .json::<SliceResultPayload>()
            .await
            .map_err(|e| DispatchError::Transport { node_id: node_id.to_string(), message: e.to_string() })
    }
}

/// Persistent bidirectional channel transport, for nodes with a live
/// sidecar connection rather than a reachable HTTP endpoint.
pub struct ChannelTransport {
    channels: RwLock<BTreeMap<String, tokio::sync::mpsc::Sender<(SliceDispatchPayload, oneshot::Sender<SliceResultPayload>)>>>,
}

impl ChannelTransport {
    /// A channel transport with no nodes registered yet.
    #[must_use]
    pub fn new() -> Self {
        Self { channels: RwLock::new(BTreeMap::new()) }
    }

    /// Register the sending half of a node's persistent channel. The
    /// node-side consumer is expected to execute the payload and
    /// fulfil the paired oneshot with its result.
    pub fn register_node(
        &self,
        node_id: &str,
        sender: tokio::sync::mpsc::Sender<(SliceDispatchPayload, oneshot::Sender<SliceResultPayload>)>,
    ) {
        self.channels.write().expect("lock poisoned").insert(node_id.to_string(), sender);
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, node_id: &str, payload: SliceDispatchPayload) -> Result<SliceResultPayload, DispatchError> {
        let sender = self
            .channels
            .read()
            .expect("lock poisoned")
            .get(node_id)
            .cloned()
            .ok_or_else(|| DispatchError::NoRoute(node_id.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send((payload, reply_tx))
            .await
            .map_err(|_| DispatchError::Transport { node_id: node_id.to_string(), message: "channel closed".into() })?;

        reply_rx
            .await
            .map_err(|_| DispatchError::Transport { node_id: node_id.to_string(), message: "sender dropped without replying".into() })
    }
}

/// Dispatches slices to nodes, preferring a registered persistent
/// channel and falling back to HTTP, with a per-node backpressure cap
/// on outstanding requests: a burst to one node never starves another.
pub struct Dispatcher {
    channel_transport: Arc<ChannelTransport>,
    http_transport: Arc<HttpTransport>,
    backpressure_cap: usize,
    backpressure: RwLock<BTreeMap<String, Arc<Semaphore>>>,
}

impl Dispatcher {
    /// A dispatcher with both transports and `backpressure_cap`
    /// concurrent outstanding requests allowed per node.
    #[must_use]
    pub fn new(channel_transport: Arc<ChannelTransport>, http_transport: Arc<HttpTransport>, backpressure_cap: usize) -> Self {
        Self { channel_transport, http_transport, backpressure_cap, backpressure: RwLock::new(BTreeMap::new()) }
    }

    /// The semaphore gating outstanding requests to `node_id`, created
    /// on first use.
    fn semaphore_for(&self, node_id: &str) -> Arc<Semaphore> {
        if let Some(semaphore) = self.backpressure.read().expect("lock poisoned").get(node_id) {
            return semaphore.clone();
        }
        self.backpressure
            .write()
            .expect("lock poisoned")
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.backpressure_cap)))
            .clone()
    }

    /// Dispatch `payload` to `node_id`, waiting at most `timeout_ms`
    /// (from the payload) for a result. A persistent channel is tried
    /// first; if none is registered for the node, HTTP is used.
    pub async fn dispatch(&self, node_id: &str, payload: SliceDispatchPayload) -> Result<SliceResultPayload, DispatchError> {
        verify_payload_checksum(&payload)?;

        let _permit = self.semaphore_for(node_id).acquire_owned().await.expect("semaphore never closed");

        let timeout_ms = payload.timeout_ms;
        let plan_id = payload.plan_id.clone();
        let slice_id = payload.slice_id.clone();
        let node_id_owned = node_id.to_string();

        let attempt = self.try_channel_then_http(node_id, payload);

        match tokio::time::timeout(Duration::from_millis(timeout_ms), attempt).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout { node_id: node_id_owned, plan_id, slice_id, timeout_ms }),
        }
    }

    async fn try_channel_then_http(&self, node_id: &str, payload: SliceDispatchPayload) -> Result<SliceResultPayload, DispatchError> {
        match self.channel_transport.send(node_id, payload.clone()).await {
            Ok(result) => Ok(result),
            Err(DispatchError::NoRoute(_)) => self.http_transport.send(node_id, payload).await,
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(plan_id: &str, slice_id: &str, timeout_ms: u64) -> SliceDispatchPayload {
        let instructions = vec![];
        let checksum = scp_core::slice::compute_slice_checksum(&instructions);
        SliceDispatchPayload {
            plan_id: plan_id.into(),
            slice_id: slice_id.into(),
            instructions,
            instruction_order: vec![],
            register_values: BTreeMap::new(),
            timeout_ms,
            checksum,
        }
    }

    fn result(plan_id: &str, slice_id: &str, node_id: &str) -> SliceResultPayload {
        SliceResultPayload {
            plan_id: plan_id.into(),
            slice_id: slice_id.into(),
            node_id: node_id.into(),
            status: SliceStatus::Success,
            output_registers: BTreeMap::new(),
            duration_ms: 1,
            error: None,
            audit_events: vec![],
        }
    }

    #[tokio::test]
    async fn falls_back_to_http_when_no_channel_registered() {
        let http = Arc::new(HttpTransport::new());
        http.register_node("edge-a", "http://edge-a.invalid");
        let channel = Arc::new(ChannelTransport::new());
        let dispatcher = Dispatcher::new(channel, http, 4);

        // No channel is registered for edge-a, so the dispatcher falls
        // through to HTTP; the URL is unreachable, so this still errors,
        // but via the HTTP path rather than NoRoute.
        let outcome = dispatcher.dispatch("edge-a", payload("p1", "s1", 50)).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn no_route_anywhere_is_reported() {
        let http = Arc::new(HttpTransport::new());
        let channel = Arc::new(ChannelTransport::new());
        let dispatcher = Dispatcher::new(channel, http, 4);
        let err = dispatcher.dispatch("ghost-node", payload("p1", "s1", 50)).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoRoute(_)));
    }

    #[tokio::test]
    async fn channel_transport_round_trips_through_oneshot() {
        let channel = ChannelTransport::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        channel.register_node("edge-a", tx);

        let responder = tokio::spawn(async move {
            let (received, reply) = rx.recv().await.expect("payload arrives");
            reply.send(result(&received.plan_id, &received.slice_id, "edge-a")).expect("reply delivered");
        });

        let outcome = channel.send("edge-a", payload("p1", "s1", 1000)).await.unwrap();
        assert_eq!(outcome.status, SliceStatus::Success);
        assert_eq!(outcome.node_id, "edge-a");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn dispatcher_times_out_when_node_never_replies() {
        let channel = ChannelTransport::new();
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        channel.register_node("edge-a", tx);
        // Keep the receiver alive but never drain it, so the node-side
        // never replies and the dispatcher's own timeout must fire.
        let _rx = rx;

        let dispatcher = Dispatcher::new(Arc::new(channel), Arc::new(HttpTransport::new()), 4);
        let err = dispatcher.dispatch("edge-a", payload("p1", "s1", 20)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn backpressure_cap_is_respected_without_deadlock() {
        let channel = ChannelTransport::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        channel.register_node("edge-a", tx);
        let responder = tokio::spawn(async move {
            for _ in 0..4 {
                let (received, reply) = rx.recv().await.expect("payload arrives");
                reply.send(result(&received.plan_id, &received.slice_id, "edge-a")).unwrap();
            }
        });

        let dispatcher = Arc::new(Dispatcher::new(Arc::new(channel), Arc::new(HttpTransport::new()), 2));
        let mut handles = Vec::new();
        for i in 0..4 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch("edge-a", payload("p1", &format!("s{i}"), 1000)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        responder.await.unwrap();
    }

    #[test]
    fn matching_checksum_verifies() {
        assert!(verify_payload_checksum(&payload("p1", "s1", 50)).is_ok());
    }

    #[test]
    fn tampered_instructions_fail_checksum_verification() {
        let mut tampered = payload("p1", "s1", 50);
        tampered.checksum = "not-the-real-checksum".into();
        let err = verify_payload_checksum(&tampered).unwrap_err();
        assert!(matches!(err, DispatchError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn dispatch_refuses_a_payload_with_a_mismatched_checksum() {
        let http = Arc::new(HttpTransport::new());
        let channel = Arc::new(ChannelTransport::new());
        let dispatcher = Dispatcher::new(channel, http, 4);

        let mut tampered = payload("p1", "s1", 50);
        tampered.checksum = "not-the-real-checksum".into();

        let err = dispatcher.dispatch("edge-a", tampered).await.unwrap_err();
        assert!(matches!(err, DispatchError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn backpressure_is_isolated_per_node() {
        // Node "busy" has its cap of 1 permit fully saturated by a
        // request that never completes; a concurrent dispatch to an
        // unrelated node must not be starved by it.
        let channel = ChannelTransport::new();
        let (busy_tx, busy_rx) = tokio::sync::mpsc::channel(4);
        channel.register_node("busy", busy_tx);
        let (other_tx, mut other_rx) = tokio::sync::mpsc::channel(4);
        channel.register_node("other", other_tx);
        let _busy_rx = busy_rx; // never drained: "busy" never gets a reply

        let dispatcher = Arc::new(Dispatcher::new(Arc::new(channel), Arc::new(HttpTransport::new()), 1));

        let busy_dispatcher = dispatcher.clone();
        let busy_handle =
            tokio::spawn(async move { busy_dispatcher.dispatch("busy", payload("p1", "s-busy", 5000)).await });

        let responder = tokio::spawn(async move {
            let (received, reply) = other_rx.recv().await.expect("payload arrives");
            reply.send(result(&received.plan_id, &received.slice_id, "other")).unwrap();
        });
        let outcome = dispatcher.dispatch("other", payload("p1", "s-other", 1000)).await;
        assert!(outcome.is_ok(), "a saturated node's backpressure cap must not block dispatch to another node");

        responder.await.unwrap();
        busy_handle.abort();
    }
}
