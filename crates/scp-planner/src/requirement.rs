//! Stage 9, step 1: requirement inference.
//!
//! For each instruction, derive either a direct node assignment (for
//! opcodes that carry one at compile time, or whose routing is a fixed
//! rule) or a [`NodeRequirement`] vector to hand to the node registry's
//! best-fit selection, following the precedence rules of spec.md §4.5.

use scp_core::ir::{IrInstruction, Opcode, Register};
use scp_core::node::{NodeRequirement, NodeTier, ServiceFormat, CENTRAL_NODE_ID};
use scp_trigger::TriggerDriverRegistry;
use std::collections::BTreeMap;

/// Either a node id already fixed by compile-time information, or a
/// requirement vector for the registry to rank candidates against.
pub(crate) enum Routing {
    Fixed(String),
    Ranked(NodeRequirement),
}

pub(crate) fn infer(
    instr: &IrInstruction,
    producer_node: &BTreeMap<Register, String>,
    trigger_registry: &TriggerDriverRegistry,
) -> Routing {
    match &instr.opcode {
        Opcode::Trigger { driver_id, config, .. } => route_trigger(driver_id, config, trigger_registry),

        Opcode::EventStateMachine { target_node_id, .. } | Opcode::HandleRemoteCmd { target_node_id, .. } => {
            Routing::Fixed(target_node_id.clone())
        }

        Opcode::HandlePropagated { .. } | Opcode::RemoteCommand { .. } => {
            Routing::Fixed(CENTRAL_NODE_ID.to_string())
        }

        Opcode::CallService { .. } | Opcode::CallAction { .. } => {
            let format = instr.dispatch_metadata.as_ref().map(|m| m.format);
            Routing::Ranked(requirement_for_format(format, instr))
        }

        Opcode::Transform { .. }
        | Opcode::Filter { .. }
        | Opcode::Aggregate { .. }
        | Opcode::Validate { .. }
        | Opcode::LoadResource { .. }
        | Opcode::StoreMemory { .. }
        | Opcode::ParallelSpawn { .. } => Routing::Fixed(data_locality_node(instr, producer_node)),
    }
}

/// TRIGGER routing: `mqtt` and `filesystem` rank registered nodes by
/// preferred tier rather than naming one; `mqtt` prefers an MCU node
/// when the trigger's `config` names a physical `protocol`, else a
/// LINUX node. Driver ids that only ever run centrally resolve
/// straight to `CENTRAL_NODE_ID`. An unknown driver id falls back to
/// whichever node declared it in its manifest, else central.
fn route_trigger(driver_id: &str, config: &serde_json::Value, trigger_registry: &TriggerDriverRegistry) -> Routing {
    match driver_id {
        "filesystem" => Routing::Ranked(NodeRequirement { preferred_tier: Some(NodeTier::Linux), ..Default::default() }),
        "mqtt" => {
            let tier = if config.get("protocol").is_some() { NodeTier::Mcu } else { NodeTier::Linux };
            Routing::Ranked(NodeRequirement { preferred_tier: Some(tier), ..Default::default() })
        }
        "http-webhook" | "imap" | "cron" | "kafka" => Routing::Fixed(CENTRAL_NODE_ID.to_string()),
        _ => Routing::Fixed(
            trigger_registry.declaring_node_id(driver_id).unwrap_or_else(|| CENTRAL_NODE_ID.to_string()),
        ),
    }
}

/// Non-service opcodes inherit the node of their data: if every `src`
/// register was produced on the same node, stay there; otherwise (no
/// sources, or sources split across nodes) fall back to central.
fn data_locality_node(instr: &IrInstruction, producer_node: &BTreeMap<Register, String>) -> String {
    let mut nodes = instr.src.iter().filter_map(|r| producer_node.get(r));
    let Some(first) = nodes.next() else {
        return CENTRAL_NODE_ID.to_string();
    };
    if nodes.all(|n| n == first) {
        first.clone()
    } else {
        CENTRAL_NODE_ID.to_string()
    }
}

fn requirement_for_format(format: Option<ServiceFormat>, instr: &IrInstruction) -> NodeRequirement {
    let mut req = NodeRequirement::default();
    let Some(format) = format else {
        return req;
    };

    req.required_formats.insert(format);

    match format {
        ServiceFormat::Docker => {
            req.preferred_tier = Some(NodeTier::Central);
        }
        ServiceFormat::Mcp => {
            req.preferred_tier = Some(NodeTier::Central);
        }
        ServiceFormat::Wasm | ServiceFormat::Native => {
            req.preferred_tier = Some(NodeTier::Linux);
        }
        ServiceFormat::Http | ServiceFormat::Grpc => {
            req.needs_internet = true;
        }
        ServiceFormat::EmbeddedJs => {
            req.preferred_tier = Some(NodeTier::Central);
        }
        ServiceFormat::Connector => {
            let connector_type = instr.dispatch_metadata.as_ref().and_then(|m| m.connector_type.as_deref());
            req.required_connector = connector_type.map(str::to_string);
            match connector_type {
                Some("gpio") | Some("i2c") | Some("spi") | Some("uart") => {
                    req.preferred_tier = Some(NodeTier::Mcu);
                }
                Some("mqtt") => {
                    req.needs_internet = true;
                }
                _ => {
                    req.preferred_tier = Some(NodeTier::Central);
                    req.needs_vault = true;
                }
            }
        }
        ServiceFormat::LlmCall => {
            req.preferred_tier = Some(NodeTier::Central);
            req.needs_vault = true;
            req.needs_internet = true;
        }
    }

    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use scp_core::ir::DispatchMetadata;
    use std::collections::BTreeMap as Map;

    fn call_service(format: ServiceFormat, connector_type: Option<&str>) -> IrInstruction {
        IrInstruction {
            index: 0,
            opcode: Opcode::CallService { capability_id: "x".into(), operands: Map::new() },
            dest: Some("r".into()),
            src: vec![],
            parallel_group_id: None,
            dispatch_metadata: Some(DispatchMetadata {
                format,
                timeout_ms: 1000,
                wasm_memory_mb: None,
                connector_type: connector_type.map(str::to_string),
            }),
            target_node_id: None,
            slice_id: None,
            required_capabilities: vec![],
        }
    }

    #[test]
    fn llm_call_requires_vault_and_internet() {
        let instr = call_service(ServiceFormat::LlmCall, None);
        let req = requirement_for_format(instr.dispatch_metadata.as_ref().map(|m| m.format), &instr);
        assert!(req.needs_vault);
        assert!(req.needs_internet);
        assert_eq!(req.preferred_tier, Some(NodeTier::Central));
    }

    #[test]
    fn physical_bus_connector_prefers_mcu() {
        let instr = call_service(ServiceFormat::Connector, Some("i2c"));
        let req = requirement_for_format(instr.dispatch_metadata.as_ref().map(|m| m.format), &instr);
        assert_eq!(req.preferred_tier, Some(NodeTier::Mcu));
    }

    #[test]
    fn http_requires_internet() {
        let instr = call_service(ServiceFormat::Http, None);
        let req = requirement_for_format(instr.dispatch_metadata.as_ref().map(|m| m.format), &instr);
        assert!(req.needs_internet);
    }

    #[test]
    fn data_locality_follows_single_producer() {
        let mut producer_node = Map::new();
        producer_node.insert("a".to_string(), "edge-1".to_string());
        let mut instr = call_service(ServiceFormat::Http, None);
        instr.src = vec!["a".to_string()];
        assert_eq!(data_locality_node(&instr, &producer_node), "edge-1");
    }

    #[test]
    fn data_locality_falls_back_to_central_on_split_producers() {
        let mut producer_node = Map::new();
        producer_node.insert("a".to_string(), "edge-1".to_string());
        producer_node.insert("b".to_string(), "edge-2".to_string());
        let mut instr = call_service(ServiceFormat::Http, None);
        instr.src = vec!["a".to_string(), "b".to_string()];
        assert_eq!(data_locality_node(&instr, &producer_node), CENTRAL_NODE_ID);
    }

    #[test]
    fn mqtt_trigger_with_protocol_prefers_mcu_tier() {
        let registry = TriggerDriverRegistry::new();
        let routing = route_trigger("mqtt", &serde_json::json!({"protocol": "MQTT", "topic": "f/1/temp"}), &registry);
        assert!(matches!(routing, Routing::Ranked(req) if req.preferred_tier == Some(NodeTier::Mcu)));
    }

    #[test]
    fn mqtt_trigger_without_protocol_prefers_linux_tier() {
        let registry = TriggerDriverRegistry::new();
        let routing = route_trigger("mqtt", &serde_json::json!({}), &registry);
        assert!(matches!(routing, Routing::Ranked(req) if req.preferred_tier == Some(NodeTier::Linux)));
    }

    #[test]
    fn filesystem_trigger_prefers_linux_tier() {
        let registry = TriggerDriverRegistry::new();
        let routing = route_trigger("filesystem", &serde_json::json!({}), &registry);
        assert!(matches!(routing, Routing::Ranked(req) if req.preferred_tier == Some(NodeTier::Linux)));
    }

    #[test]
    fn cron_trigger_is_fixed_to_central() {
        let registry = TriggerDriverRegistry::new();
        let routing = route_trigger("cron", &serde_json::json!({}), &registry);
        assert!(matches!(routing, Routing::Fixed(node_id) if node_id == CENTRAL_NODE_ID));
    }

    #[test]
    fn unknown_driver_falls_back_to_its_declaring_node() {
        use scp_trigger::{DriverMetadata, RemoteDriverProxy};

        let registry = TriggerDriverRegistry::new();
        registry.register_remote(RemoteDriverProxy {
            metadata: DriverMetadata {
                driver_id: "modbus-rtu".into(),
                display_name: "Modbus RTU".into(),
                supported_tiers: vec![NodeTier::Mcu],
                config_schema: serde_json::json!({}),
                required_protocols: vec![],
            },
            source_node_id: "mcu-7".into(),
        });

        let routing = route_trigger("modbus-rtu", &serde_json::json!({}), &registry);
        assert!(matches!(routing, Routing::Fixed(node_id) if node_id == "mcu-7"));
    }

    #[test]
    fn unknown_undeclared_driver_falls_back_to_central() {
        let registry = TriggerDriverRegistry::new();
        let routing = route_trigger("mystery", &serde_json::json!({}), &registry);
        assert!(matches!(routing, Routing::Fixed(node_id) if node_id == CENTRAL_NODE_ID));
    }
}
