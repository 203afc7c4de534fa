// Heterogeneous node capability profile.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reserved node id for the always-present central orchestrator.
pub const CENTRAL_NODE_ID: &str = "central";

/// Coarse class of execution node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeTier {
    /// The central orchestrator. Exactly one exists per deployment.
    Central,
    /// A Linux edge node.
    Linux,
    /// A microcontroller.
    Mcu,
}

/// Executable service formats a node may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceFormat {
    /// Sandboxed WebAssembly module.
    Wasm,
    /// Native binary invocation.
    Native,
    /// JSON-RPC sidecar (Model Context Protocol).
    Mcp,
    /// Spawned container.
    Docker,
    /// Plain HTTP call.
    Http,
    /// gRPC call.
    Grpc,
    /// Sandboxed embedded JavaScript.
    EmbeddedJs,
    /// Registered typed connector adapter.
    Connector,
    /// Bounded remote LLM inference call.
    LlmCall,
}

/// Wire/bus protocols a node may speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
    /// Apache Kafka.
    Kafka,
    /// MQTT pub/sub.
    Mqtt,
    /// Modbus industrial protocol.
    Modbus,
    /// OPC-UA industrial protocol.
    OpcUa,
    /// I2C bus.
    I2c,
    /// SPI bus.
    Spi,
    /// UART serial.
    Uart,
    /// GPIO digital I/O.
    Gpio,
}

impl Protocol {
    /// Physical-bus protocols that only a microcontroller is expected to
    /// speak directly.
    #[must_use]
    pub fn is_physical_bus(self) -> bool {
        matches!(
            self,
            Protocol::I2c | Protocol::Spi | Protocol::Uart | Protocol::Gpio | Protocol::Modbus
        )
    }
}

/// Current health state of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    /// Reachable and accepting work.
    Online,
    /// Known unreachable; heartbeat has lapsed.
    Offline,
    /// Reachable but at capacity.
    Busy,
    /// Reachable but reporting reduced functionality.
    Degraded,
}

/// Physical resource profile of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Hardware {
    /// Total addressable memory in megabytes.
    pub memory_mb: u64,
    /// Number of CPU cores.
    pub cpu_cores: u32,
}

/// A single registered node's declared capability profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeCapability {
    /// Unique node identifier.
    pub node_id: String,
    /// Coarse tier.
    pub tier: NodeTier,
    /// Service formats this node can execute.
    pub supported_formats: BTreeSet<ServiceFormat>,
    /// Wire/bus protocols this node can speak.
    pub supported_protocols: BTreeSet<Protocol>,
    /// Connector ids this node supports; `"*"` is a wildcard.
    pub supported_connectors: BTreeSet<String>,
    /// Trigger driver ids this node supports; `"*"` is a wildcard (always
    /// true for the central node).
    pub supported_trigger_drivers: BTreeSet<String>,
    /// Whether this node can reach the public internet.
    pub has_internet_access: bool,
    /// Whether this node can resolve vault-backed secrets.
    pub has_vault_access: bool,
    /// Whether this node may spawn subprocesses (required for `NATIVE`
    /// and `DOCKER` executors).
    pub can_spawn_processes: bool,
    /// Physical resource profile.
    pub hardware: Hardware,
    /// Maximum number of instructions the planner may pack into one
    /// slice for this node.
    pub max_instructions_per_slice: usize,
    /// Current health state.
    pub status: NodeStatus,
    /// Timestamp of the last accepted heartbeat.
    pub last_seen_at: DateTime<Utc>,
    /// Measured round-trip latency to the central orchestrator.
    pub latency_to_central_ms: u64,
    /// Base URL for synchronous request/response dispatch, if this node
    /// does not have a persistent channel registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl NodeCapability {
    /// Construct the always-present central orchestrator node.
    #[must_use]
    pub fn central(now: DateTime<Utc>) -> Self {
        Self {
            node_id: CENTRAL_NODE_ID.to_string(),
            tier: NodeTier::Central,
            supported_formats: [
                ServiceFormat::Wasm,
                ServiceFormat::Native,
                ServiceFormat::Mcp,
                ServiceFormat::Docker,
                ServiceFormat::Http,
                ServiceFormat::Grpc,
                ServiceFormat::EmbeddedJs,
                ServiceFormat::Connector,
                ServiceFormat::LlmCall,
            ]
            .into_iter()
            .collect(),
            supported_protocols: [Protocol::Http, Protocol::Https, Protocol::Kafka, Protocol::Mqtt]
                .into_iter()
                .collect(),
            supported_connectors: ["*".to_string()].into_iter().collect(),
            supported_trigger_drivers: ["*".to_string()].into_iter().collect(),
            has_internet_access: true,
            has_vault_access: true,
            can_spawn_processes: true,
            hardware: Hardware {
                memory_mb: 16_384,
                cpu_cores: 8,
            },
            max_instructions_per_slice: usize::MAX,
            status: NodeStatus::Online,
            last_seen_at: now,
            latency_to_central_ms: 0,
            base_url: None,
        }
    }

    /// `true` if `connector_id` is supported, honoring the `"*"` wildcard.
    #[must_use]
    pub fn supports_connector(&self, connector_id: &str) -> bool {
        self.supported_connectors.contains("*") || self.supported_connectors.contains(connector_id)
    }

    /// `true` if `driver_id` is supported, honoring the `"*"` wildcard.
    #[must_use]
    pub fn supports_trigger_driver(&self, driver_id: &str) -> bool {
        self.supported_trigger_drivers.contains("*")
            || self.supported_trigger_drivers.contains(driver_id)
    }
}

/// A requirement vector a node must satisfy to be eligible for an
/// instruction, used by the node registry's best-fit selection (§4.2).
#[derive(Debug, Clone, Default)]
pub struct NodeRequirement {
    /// Service formats the node must support (subset-of relation).
    pub required_formats: BTreeSet<ServiceFormat>,
    /// Protocols the node must support (subset-of relation).
    pub required_protocols: BTreeSet<Protocol>,
    /// A connector id the node must support, if any.
    pub required_connector: Option<String>,
    /// Whether vault access is required.
    pub needs_vault: bool,
    /// Whether internet access is required.
    pub needs_internet: bool,
    /// Minimum available memory in megabytes.
    pub min_memory_mb: u64,
    /// Preferred tier, used as a ranking signal, not a hard filter.
    pub preferred_tier: Option<NodeTier>,
    /// Bypass matching entirely and force this node id.
    pub forced_node_id: Option<String>,
}

impl NodeCapability {
    /// `true` if this node satisfies every hard constraint in `req`.
    #[must_use]
    pub fn satisfies(&self, req: &NodeRequirement) -> bool {
        if self.status == NodeStatus::Offline {
            return false;
        }
        if !req.required_formats.is_subset(&self.supported_formats) {
            return false;
        }
        if !req.required_protocols.is_subset(&self.supported_protocols) {
            return false;
        }
        if let Some(connector) = &req.required_connector {
            if !self.supports_connector(connector) {
                return false;
            }
        }
        if req.needs_vault && !self.has_vault_access {
            return false;
        }
        if req.needs_internet && !self.has_internet_access {
            return false;
        }
        if self.hardware.memory_mb < req.min_memory_mb {
            return false;
        }
        true
    }
}
