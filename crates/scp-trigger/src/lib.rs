#![deny(unsafe_code)]
#![warn(missing_docs)]
//! scp-trigger
//!
//! The Trigger Driver Registry (component C3) and Trigger Activation
//! (component C8): pluggable event sources whose activation yields
//! [`TriggerEvent`]s consumed as workflow entry points, local or
//! proxied to a remote node.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// An event emitted by an activated trigger driver, consumed as a
/// workflow entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// The activation this event belongs to.
    pub activation_id: String,
    /// Arbitrary driver-specific payload.
    pub payload: Value,
    /// When the underlying event occurred, RFC 3339.
    pub occurred_at: String,
}

/// Metadata surface common to local and remote-declared drivers
/// (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverMetadata {
    /// Unique driver identifier (`"mqtt"`, `"cron"`, `"filesystem"`, …).
    pub driver_id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Node tiers capable of running this driver.
    pub supported_tiers: Vec<scp_core::node::NodeTier>,
    /// JSON Schema for this driver's configuration object.
    pub config_schema: Value,
    /// Wire/bus protocols this driver requires.
    pub required_protocols: Vec<scp_core::node::Protocol>,
}

/// A driver implemented in-process on the central node.
#[async_trait]
pub trait LocalTriggerDriver: Send + Sync {
    /// Static metadata for this driver.
    fn metadata(&self) -> DriverMetadata;

    /// `true` if the driver's upstream dependency (broker, filesystem
    /// watch, etc.) is currently reachable.
    fn is_healthy(&self) -> bool;

    /// Begin emitting events for one activation. Returns a channel the
    /// caller reads from; the task backing it is cancelled when the
    /// sender is dropped.
    async fn activate(
        &self,
        activation_id: String,
        config: Value,
        workflow_id: String,
        workflow_version: u64,
    ) -> mpsc::Receiver<TriggerEvent>;
}

/// A proxy standing in for a driver declared by a remote node.
/// `activate` is inert: activation for a remote driver is a dispatcher
/// concern (see [`TriggerActivationManager::activate`]), not something
/// the proxy itself can do in-process.
#[derive(Debug, Clone)]
pub struct RemoteDriverProxy {
    /// Metadata as declared by the remote node's manifest.
    pub metadata: DriverMetadata,
    /// The node that declared this driver.
    pub source_node_id: String,
}

/// Either a local driver implementation or a remote-declared proxy.
pub enum DriverEntry {
    /// In-process driver.
    Local(Arc<dyn LocalTriggerDriver>),
    /// Remote-declared proxy.
    Remote(RemoteDriverProxy),
}

impl DriverEntry {
    /// Metadata common to both entry kinds.
    #[must_use]
    pub fn metadata(&self) -> DriverMetadata {
        match self {
            DriverEntry::Local(driver) => driver.metadata(),
            DriverEntry::Remote(proxy) => proxy.metadata.clone(),
        }
    }

    /// `true` for a local driver, `false` for a remote proxy.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, DriverEntry::Local(_))
    }
}

/// Registry of known trigger drivers, local and remote-declared.
#[derive(Default)]
pub struct TriggerDriverRegistry {
    drivers: RwLock<BTreeMap<String, DriverEntry>>,
}

impl TriggerDriverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local driver. A pre-existing entry with the same
    /// `driver_id` is overwritten, with a warning logged (spec.md §4.3).
    pub fn register_local(&self, driver: Arc<dyn LocalTriggerDriver>) {
        let id = driver.metadata().driver_id;
        self.insert(id, DriverEntry::Local(driver));
    }

    /// Register a remote-declared proxy, as reported by a node's
    /// manifest. Overwrites any pre-existing entry for the same id.
    pub fn register_remote(&self, proxy: RemoteDriverProxy) {
        let id = proxy.metadata.driver_id.clone();
        self.insert(id, DriverEntry::Remote(proxy));
    }

    fn insert(&self, id: String, entry: DriverEntry) {
        let mut drivers = self.drivers.write().expect("registry lock poisoned");
        if drivers.contains_key(&id) {
            tracing::warn!(driver_id = %id, "duplicate trigger driver id, overwriting");
        }
        drivers.insert(id, entry);
    }

    /// Remove every remote proxy declared by `node_id`, called on node
    /// disconnect (spec.md §4.3).
    pub fn purge_node(&self, node_id: &str) -> Vec<String> {
        let mut drivers = self.drivers.write().expect("registry lock poisoned");
        let to_remove: Vec<String> = drivers
            .iter()
            .filter_map(|(id, entry)| match entry {
                DriverEntry::Remote(proxy) if proxy.source_node_id == node_id => Some(id.clone()),
                _ => None,
            })
            .collect();
        for id in &to_remove {
            drivers.remove(id);
            tracing::info!(driver_id = %id, node_id, "remote trigger driver purged on disconnect");
        }
        to_remove
    }

    /// Look up the registered entry for `driver_id`, if known.
    #[must_use]
    pub fn get_metadata(&self, driver_id: &str) -> Option<DriverMetadata> {
        self.drivers
            .read()
            .expect("registry lock poisoned")
            .get(driver_id)
            .map(DriverEntry::metadata)
    }

    /// The node id that declared `driver_id` in its manifest, if it is
    /// a remote-declared proxy. `None` for local drivers and unknown ids.
    #[must_use]
    pub fn declaring_node_id(&self, driver_id: &str) -> Option<String> {
        self.drivers.read().expect("registry lock poisoned").get(driver_id).and_then(|entry| match entry {
            DriverEntry::Remote(proxy) => Some(proxy.source_node_id.clone()),
            DriverEntry::Local(_) => None,
        })
    }

    /// `true` if `driver_id` is registered as a local driver.
    #[must_use]
    pub fn is_local(&self, driver_id: &str) -> bool {
        self.drivers
            .read()
            .expect("registry lock poisoned")
            .get(driver_id)
            .is_some_and(DriverEntry::is_local)
    }
}

/// A single active trigger wiring for one workflow.
struct Activation {
    reference_count: u64,
    _cancel: mpsc::Sender<()>,
}

/// Binds `TRIGGER` instructions to running driver instances, debounces
/// their output, and reference-counts deactivation per workflow
/// (spec.md §4.8).
pub struct TriggerActivationManager {
    registry: Arc<TriggerDriverRegistry>,
    activations: RwLock<BTreeMap<String, Activation>>,
    next_activation_seq: AtomicU64,
}

/// A remote activation request constructed when the target node is not
/// central (spec.md §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTriggerActivationPayload {
    /// Unique id assigned to this activation.
    pub activation_id: String,
    /// The driver to activate on the remote node.
    pub driver_id: String,
    /// Merged driver configuration, including compiled filter and debounce.
    pub driver_config: Value,
    /// The workflow this activation serves.
    pub workflow_id: String,
    /// The workflow version this activation was compiled from.
    pub workflow_version: u64,
    /// Compiled event filter, if the trigger instruction declared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_filter: Option<Value>,
    /// Bus channel the fired events will arrive on: `"trigger_events:" + workflow_id`.
    pub callback_channel: String,
}

impl RemoteTriggerActivationPayload {
    /// The bus channel name fired events for `workflow_id` arrive on.
    #[must_use]
    pub fn callback_channel_for(workflow_id: &str) -> String {
        format!("trigger_events:{workflow_id}")
    }
}

/// Where an activation was bound: a local driver feeding the bus
/// directly, or a payload to dispatch to a remote node.
pub enum ActivationOutcome {
    /// Bound to a local driver; events already arrive on `events`.
    Local {
        /// The activation id assigned.
        activation_id: String,
        /// Debounced event stream.
        events: mpsc::Receiver<TriggerEvent>,
    },
    /// Bound to a remote driver; the caller must dispatch `payload` to
    /// `node_id` and subscribe the bus to its callback channel.
    Remote {
        /// The node the driver is declared on.
        node_id: String,
        /// The payload to send.
        payload: RemoteTriggerActivationPayload,
    },
}

impl TriggerActivationManager {
    /// Create a manager bound to `registry`.
    #[must_use]
    pub fn new(registry: Arc<TriggerDriverRegistry>) -> Self {
        Self {
            registry,
            activations: RwLock::new(BTreeMap::new()),
            next_activation_seq: AtomicU64::new(1),
        }
    }

    fn fresh_activation_id(&self, workflow_id: &str) -> String {
        let seq = self.next_activation_seq.fetch_add(1, Ordering::SeqCst);
        format!("act-{workflow_id}-{seq}")
    }

    /// Activate the driver for a `TRIGGER` instruction. `target_node_id`
    /// of `"central"` binds to the local driver directly (spawning a
    /// debounce stage in front of its raw event stream); any other
    /// target produces a [`RemoteTriggerActivationPayload`] for the
    /// caller to dispatch.
    ///
    /// # Panics
    ///
    /// Panics if `driver_id` names a driver registered as local while
    /// `target_node_id` is not `"central"`, or vice versa — this is a
    /// compiler invariant violation the distribution planner should
    /// never produce.
    pub async fn activate(
        &self,
        driver_id: &str,
        target_node_id: &str,
        mut config: Value,
        workflow_id: &str,
        workflow_version: u64,
        debounce_ms: Option<u64>,
        compiled_filter: Option<Value>,
    ) -> ActivationOutcome {
        let activation_id = self.fresh_activation_id(workflow_id);
        if let Some(filter) = &compiled_filter {
            config["compiledFilter"] = filter.clone();
        }
        if let Some(ms) = debounce_ms {
            config["debounceMs"] = Value::from(ms);
        }

        let (cancel_tx, _cancel_rx) = mpsc::channel(1);
        self.activations.write().expect("activation lock poisoned").insert(
            activation_id.clone(),
            Activation {
                reference_count: 1,
                _cancel: cancel_tx,
            },
        );

        if target_node_id == scp_core::node::CENTRAL_NODE_ID {
            let driver = {
                let drivers = self.registry.drivers.read().expect("registry lock poisoned");
                match drivers.get(driver_id) {
                    Some(DriverEntry::Local(driver)) => driver.clone(),
                    _ => panic!("activate called with non-local driver id {driver_id} targeting central"),
                }
            };
            let raw = driver
                .activate(activation_id.clone(), config, workflow_id.to_string(), workflow_version)
                .await;
            let events = debounce(raw, debounce_ms);
            ActivationOutcome::Local { activation_id, events }
        } else {
            let payload = RemoteTriggerActivationPayload {
                activation_id,
                driver_id: driver_id.to_string(),
                driver_config: config,
                workflow_id: workflow_id.to_string(),
                workflow_version,
                compiled_filter,
                callback_channel: RemoteTriggerActivationPayload::callback_channel_for(workflow_id),
            };
            ActivationOutcome::Remote {
                node_id: target_node_id.to_string(),
                payload,
            }
        }
    }

    /// Increment the reference count for an already-active activation
    /// (a second consumer of the same trigger).
    pub fn retain(&self, activation_id: &str) {
        if let Some(activation) = self.activations.write().expect("activation lock poisoned").get_mut(activation_id) {
            activation.reference_count += 1;
        }
    }

    /// Decrement the reference count; the activation is torn down (its
    /// cancellation sender dropped, stopping the driver task) once it
    /// reaches zero. Returns `true` if this call tore the activation down.
    pub fn release(&self, activation_id: &str) -> bool {
        let mut activations = self.activations.write().expect("activation lock poisoned");
        let Some(activation) = activations.get_mut(activation_id) else {
            return false;
        };
        activation.reference_count = activation.reference_count.saturating_sub(1);
        if activation.reference_count == 0 {
            activations.remove(activation_id);
            true
        } else {
            false
        }
    }

    /// Deactivate every activation belonging to `workflow_id`,
    /// regardless of reference count — called when a workflow is
    /// undeployed.
    pub fn deactivate_workflow(&self, workflow_id: &str) -> usize {
        let prefix = format!("act-{workflow_id}-");
        let mut activations = self.activations.write().expect("activation lock poisoned");
        let before = activations.len();
        activations.retain(|id, _| !id.starts_with(&prefix));
        before - activations.len()
    }

    /// Number of currently live activations.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.activations.read().expect("activation lock poisoned").len()
    }
}

/// Apply rolling-window debounce to a raw event stream: when
/// `debounce_ms > 0`, only the most recent event received within each
/// window is forwarded (spec.md §4.8).
fn debounce(mut raw: mpsc::Receiver<TriggerEvent>, debounce_ms: Option<u64>) -> mpsc::Receiver<TriggerEvent> {
    let Some(window_ms) = debounce_ms.filter(|ms| *ms > 0) else {
        return raw;
    };
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let window = std::time::Duration::from_millis(window_ms);
        loop {
            let Some(mut pending) = raw.recv().await else {
                break;
            };
            loop {
                match tokio::time::timeout(window, raw.recv()).await {
                    Ok(Some(next)) => pending = next,
                    Ok(None) => {
                        let _ = tx.send(pending).await;
                        return;
                    }
                    Err(_elapsed) => break,
                }
            }
            if tx.send(pending).await.is_err() {
                return;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp_core::node::{NodeTier, Protocol};

    struct CountingDriver {
        id: &'static str,
    }

    #[async_trait]
    impl LocalTriggerDriver for CountingDriver {
        fn metadata(&self) -> DriverMetadata {
            DriverMetadata {
                driver_id: self.id.to_string(),
                display_name: "Counting".to_string(),
                supported_tiers: vec![NodeTier::Central],
                config_schema: serde_json::json!({}),
                required_protocols: vec![Protocol::Http],
            }
        }

        fn is_healthy(&self) -> bool {
            true
        }

        async fn activate(
            &self,
            activation_id: String,
            _config: Value,
            _workflow_id: String,
            _workflow_version: u64,
        ) -> mpsc::Receiver<TriggerEvent> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for i in 0..3 {
                    let _ = tx
                        .send(TriggerEvent {
                            activation_id: activation_id.clone(),
                            payload: serde_json::json!({ "seq": i }),
                            occurred_at: "2026-01-01T00:00:00Z".to_string(),
                        })
                        .await;
                }
            });
            rx
        }
    }

    #[test]
    fn duplicate_registration_overwrites() {
        let registry = TriggerDriverRegistry::new();
        registry.register_local(Arc::new(CountingDriver { id: "cron" }));
        registry.register_local(Arc::new(CountingDriver { id: "cron" }));
        assert!(registry.get_metadata("cron").is_some());
    }

    #[test]
    fn purge_node_removes_only_its_proxies() {
        let registry = TriggerDriverRegistry::new();
        registry.register_remote(RemoteDriverProxy {
            metadata: DriverMetadata {
                driver_id: "mqtt".to_string(),
                display_name: "MQTT".to_string(),
                supported_tiers: vec![NodeTier::Mcu],
                config_schema: serde_json::json!({}),
                required_protocols: vec![Protocol::Mqtt],
            },
            source_node_id: "edge-a".to_string(),
        });
        registry.register_remote(RemoteDriverProxy {
            metadata: DriverMetadata {
                driver_id: "filesystem".to_string(),
                display_name: "Filesystem".to_string(),
                supported_tiers: vec![NodeTier::Linux],
                config_schema: serde_json::json!({}),
                required_protocols: vec![],
            },
            source_node_id: "edge-b".to_string(),
        });
        let removed = registry.purge_node("edge-a");
        assert_eq!(removed, vec!["mqtt".to_string()]);
        assert!(registry.get_metadata("mqtt").is_none());
        assert!(registry.get_metadata("filesystem").is_some());
    }

    #[tokio::test]
    async fn activate_local_feeds_event_stream() {
        let registry = Arc::new(TriggerDriverRegistry::new());
        registry.register_local(Arc::new(CountingDriver { id: "cron" }));
        let manager = TriggerActivationManager::new(registry);
        let outcome = manager
            .activate("cron", "central", serde_json::json!({}), "wf-1", 1, None, None)
            .await;
        match outcome {
            ActivationOutcome::Local { mut events, .. } => {
                let mut count = 0;
                while events.recv().await.is_some() {
                    count += 1;
                }
                assert_eq!(count, 3);
            }
            ActivationOutcome::Remote { .. } => panic!("expected local outcome"),
        }
    }

    #[tokio::test]
    async fn activate_remote_produces_payload_with_callback_channel() {
        let registry = Arc::new(TriggerDriverRegistry::new());
        registry.register_remote(RemoteDriverProxy {
            metadata: DriverMetadata {
                driver_id: "mqtt".to_string(),
                display_name: "MQTT".to_string(),
                supported_tiers: vec![NodeTier::Mcu],
                config_schema: serde_json::json!({}),
                required_protocols: vec![Protocol::Mqtt],
            },
            source_node_id: "edge-a".to_string(),
        });
        let manager = TriggerActivationManager::new(registry);
        let outcome = manager
            .activate("mqtt", "edge-a", serde_json::json!({}), "wf-1", 1, None, None)
            .await;
        match outcome {
            ActivationOutcome::Remote { node_id, payload } => {
                assert_eq!(node_id, "edge-a");
                assert_eq!(payload.callback_channel, "trigger_events:wf-1");
            }
            ActivationOutcome::Local { .. } => panic!("expected remote outcome"),
        }
    }

    #[tokio::test]
    async fn release_tears_down_at_zero_refcount() {
        let registry = Arc::new(TriggerDriverRegistry::new());
        registry.register_local(Arc::new(CountingDriver { id: "cron" }));
        let manager = TriggerActivationManager::new(registry);
        let outcome = manager
            .activate("cron", "central", serde_json::json!({}), "wf-1", 1, None, None)
            .await;
        let activation_id = match outcome {
            ActivationOutcome::Local { activation_id, .. } => activation_id,
            ActivationOutcome::Remote { .. } => unreachable!(),
        };
        manager.retain(&activation_id);
        assert!(!manager.release(&activation_id));
        assert!(manager.release(&activation_id));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn deactivate_workflow_removes_all_its_activations() {
        let registry = Arc::new(TriggerDriverRegistry::new());
        registry.register_local(Arc::new(CountingDriver { id: "cron" }));
        let manager = TriggerActivationManager::new(registry);
        manager
            .activate("cron", "central", serde_json::json!({}), "wf-1", 1, None, None)
            .await;
        manager
            .activate("cron", "central", serde_json::json!({}), "wf-1", 1, None, None)
            .await;
        let removed = manager.deactivate_workflow("wf-1");
        assert_eq!(removed, 2);
        assert_eq!(manager.active_count(), 0);
    }
}
