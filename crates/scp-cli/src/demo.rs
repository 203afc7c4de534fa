//! `run-demo`: an in-memory, network-free walk through the whole
//! pipeline, end to end, over one small workflow.
//!
//! Every instruction here is chosen so the distribution planner routes
//! it to the central node deterministically (an `http-webhook` trigger
//! is fixed-routed to central; the `TRANSFORM` inherits its trigger's
//! locality; the `CALL_SERVICE` targets a `FunctionRef` capability,
//! whose only registered executor, `NativeExecutor`, the central node
//! always supports) so the demo never touches a network socket.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use scp_audit::AuditChain;
use scp_catalog::{Catalog, CapabilityRegistry};
use scp_compiler::{compile, IntakeInstruction, WorkflowDescription};
use scp_core::capability::{CapabilityCategory, EstimatedCost, ExecutorRef, PerformanceHints};
use scp_core::config::Config;
use scp_core::ir::{IrMetadata, Opcode};
use scp_core::node::{Hardware, NodeCapability, NodeStatus, NodeTier};
use scp_dispatcher::{ChannelTransport, Dispatcher, HttpTransport};
use scp_node_registry::NodeRegistry;
use scp_svm::central::CentralOrchestrator;
use scp_svm::executor::ExecutorRegistry;
use scp_svm::executors::NativeExecutor;
use scp_svm::vault::InMemoryVault;
use scp_svm::{builtin::WorkflowMemory, cancel::CancellationToken, RegisterFile, Vm};
use scp_telemetry::{MetricsCollector, RunMetrics};
use scp_trigger::{DriverMetadata, RemoteDriverProxy, TriggerDriverRegistry};
use serde_json::json;

const WORKFLOW_ID: &str = "demo-workflow";
const CAPABILITY_ID: &str = "demo.echo";

fn demo_workflow() -> WorkflowDescription {
    WorkflowDescription {
        metadata: IrMetadata { workflow_id: WORKFLOW_ID.to_string(), workflow_version: 1 },
        instructions: vec![
            IntakeInstruction {
                index: 0,
                opcode: Opcode::Trigger {
                    driver_id: "http-webhook".to_string(),
                    config: json!({}),
                    credentials_vault_path: None,
                    debounce_ms: 0,
                },
                dest: Some("event".to_string()),
                src: vec![],
            },
            IntakeInstruction {
                index: 1,
                opcode: Opcode::Transform { expression: "identity".to_string(), params: BTreeMap::new() },
                dest: Some("payload".to_string()),
                src: vec!["event".to_string()],
            },
            IntakeInstruction {
                index: 2,
                opcode: Opcode::CallService { capability_id: CAPABILITY_ID.to_string(), operands: BTreeMap::new() },
                dest: Some("result".to_string()),
                src: vec!["payload".to_string()],
            },
        ],
    }
}

fn demo_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register(
        CAPABILITY_ID,
        "Demo Echo",
        CapabilityCategory::Service,
        "Echoes its input back, locally, for the run-demo walkthrough",
        vec![],
        vec![],
        ExecutorRef::FunctionRef { name: "echo".to_string() },
        PerformanceHints {
            estimated_duration_ms: 5,
            cacheable: false,
            cache_ttl_secs: None,
            supports_parallel: false,
            is_llm_call: false,
            estimated_cost: EstimatedCost::new(0.0, 1.0),
        },
    );
    registry
}

/// Report printed at the end of [`run`].
pub struct DemoReport {
    /// Final register contents after execution.
    pub registers: RegisterFile,
    /// Audit chain verification for the workflow.
    pub verification_summary: String,
    /// Aggregated run metrics (a single run).
    pub metrics_summary: String,
    /// `true` if the workflow was distributed across more than one node.
    pub is_distributed: bool,
    /// Node ids swept offline (and had their remote-declared trigger
    /// drivers purged) before planning, demonstrating spec.md §4.2/§4.3's
    /// heartbeat-to-purge cascade.
    pub offline_nodes_swept: Vec<String>,
}

/// A stale edge node the demo seeds to exercise the heartbeat-sweep
/// cascade: it last reported in long before `now`, so it is found
/// offline before the workflow is planned, the way an edge node that
/// crashed between heartbeats would be.
fn stale_edge_sensor(now: chrono::DateTime<Utc>) -> NodeCapability {
    NodeCapability {
        node_id: "edge-sensor".to_string(),
        tier: NodeTier::Mcu,
        supported_formats: Default::default(),
        supported_protocols: Default::default(),
        supported_connectors: Default::default(),
        supported_trigger_drivers: ["mqtt".to_string()].into_iter().collect(),
        has_internet_access: false,
        has_vault_access: false,
        can_spawn_processes: false,
        hardware: Hardware { memory_mb: 256, cpu_cores: 1 },
        max_instructions_per_slice: 16,
        status: NodeStatus::Online,
        last_seen_at: now - chrono::Duration::hours(1),
        latency_to_central_ms: 40,
        base_url: None,
    }
}

/// Build the demo workflow, compile it, plan its distribution, execute
/// it, verify its audit chain, and summarize its metrics.
pub async fn run() -> Result<DemoReport> {
    let now = Utc::now();

    let catalog = Catalog::new();
    let capability_registry = demo_registry();
    let config = Config::new("demo-signing-secret");

    let workflow = demo_workflow();
    let compiled = compile(&workflow, &catalog, &capability_registry, &config)
        .map_err(|issues| anyhow::anyhow!("compilation failed: {issues:?}"))?;

    let node_registry = NodeRegistry::new(now, 30);
    let trigger_registry = TriggerDriverRegistry::new();

    node_registry.register(stale_edge_sensor(now));
    trigger_registry.register_remote(RemoteDriverProxy {
        metadata: DriverMetadata {
            driver_id: "mqtt".to_string(),
            display_name: "MQTT".to_string(),
            supported_tiers: vec![NodeTier::Mcu],
            config_schema: json!({}),
            required_protocols: vec![],
        },
        source_node_id: "edge-sensor".to_string(),
    });
    let offline_nodes_swept = node_registry.sweep_offline_and_purge_triggers(&trigger_registry, now);

    let resolved = scp_planner::plan(&compiled.resolved, &node_registry, &trigger_registry);
    let plan = resolved.distribution_plan.as_ref().context("planner did not attach a distribution plan")?;

    let mut executors = ExecutorRegistry::new();
    executors.register(Arc::new(NativeExecutor));
    let vm = Vm::new(executors, Arc::new(InMemoryVault::new()));

    let dispatcher = Arc::new(Dispatcher::new(Arc::new(ChannelTransport::new()), Arc::new(HttpTransport::new()), 8));
    let offline = Arc::new(scp_svm::offline::OfflineBuffer::new());
    let orchestrator = CentralOrchestrator::new(vm, dispatcher, offline);

    let audit = Arc::new(AuditChain::new());
    let writer = audit.register_writer(WORKFLOW_ID).context("register audit writer")?;
    let memory = WorkflowMemory::new();
    let cancellation = CancellationToken::new();

    let mut initial_registers: RegisterFile = BTreeMap::new();
    initial_registers.insert("event".to_string(), json!({"source": "http-webhook", "body": {"hello": "scp"}}));

    let started = std::time::Instant::now();
    let registers = orchestrator
        .execute_plan("demo-plan", plan, WORKFLOW_ID, &audit, &writer, initial_registers, &memory, &cancellation)
        .await
        .context("executing the demo plan")?;
    let duration_ms = started.elapsed().as_millis() as u64;

    let verification = audit.verify_chain(WORKFLOW_ID);
    let verification_summary = format!(
        "{} events, verified={}, first_broken_at={:?}",
        verification.total_events, verification.verified, verification.first_broken_at
    );

    let metrics = MetricsCollector::new();
    metrics.record(RunMetrics {
        workflow_id: WORKFLOW_ID.to_string(),
        plan_id: "demo-plan".to_string(),
        duration_ms,
        slices_executed: plan.slices.len() as u64,
        audit_events_appended: verification.total_events as u64,
        sync_points_failed: 0,
        sync_points_skipped: 0,
        sync_points_defaulted: 0,
        errors_count: 0,
    });
    let summary = metrics.summary();
    let metrics_summary = format!(
        "runs={} mean_ms={:.1} p99_ms={:.1} total_audit_events={}",
        summary.count, summary.mean_duration_ms, summary.p99_duration_ms, summary.total_audit_events
    );

    Ok(DemoReport {
        registers,
        verification_summary,
        metrics_summary,
        is_distributed: plan.is_distributed,
        offline_nodes_swept,
    })
}
