#![deny(unsafe_code)]
//! Command-line entry point for the Semantic Compiler Platform.

mod commands;
mod demo;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use commands::SchemaKind;
use scp_telemetry::{init_tracing, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "scp", version, about = "Semantic Compiler Platform CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging (`scp=debug`).
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the JSON schema for a wire type.
    Schema {
        /// Which type to print the schema for.
        #[arg(value_enum)]
        kind: SchemaKindArg,
    },

    /// Compile, plan, and execute a small built-in workflow end to end,
    /// entirely in-process (no network calls), and print the result.
    RunDemo,

    /// List the platform's components.
    Components,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SchemaKindArg {
    Instruction,
    Capability,
    DistributionPlan,
    AuditEvent,
    Node,
}

impl From<SchemaKindArg> for SchemaKind {
    fn from(arg: SchemaKindArg) -> Self {
        match arg {
            SchemaKindArg::Instruction => SchemaKind::Instruction,
            SchemaKindArg::Capability => SchemaKind::Capability,
            SchemaKindArg::DistributionPlan => SchemaKind::DistributionPlan,
            SchemaKindArg::AuditEvent => SchemaKind::AuditEvent,
            SchemaKindArg::Node => SchemaKind::Node,
        }
    }
}

/// The platform's eleven named components (spec.md §4), for operator
/// visibility.
const COMPONENTS: &[(&str, &str)] = &[
    ("C1", "Capability Catalog (scp-catalog)"),
    ("C2", "Node Registry (scp-node-registry)"),
    ("C3", "Trigger Driver Registry (scp-trigger)"),
    ("C4", "Compilation Pipeline (scp-compiler)"),
    ("C5", "Distribution Planner (scp-planner)"),
    ("C6", "Version Lifecycle (scp-version)"),
    ("C7", "Slice Dispatcher (scp-dispatcher)"),
    ("C8", "Trigger Activation (scp-trigger)"),
    ("C9", "Semantic Virtual Machine (scp-svm)"),
    ("C10", "Central Orchestrator (scp-svm::central)"),
    ("C11", "Audit Chain (scp-audit)"),
];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "scp=debug" } else { "scp=info" };
    init_tracing(LogFormat::from_env(), filter);

    match cli.command {
        Commands::Schema { kind } => {
            println!("{}", commands::schema_json(kind.into())?);
        }
        Commands::RunDemo => {
            let report = demo::run().await?;
            println!("registers: {}", serde_json::to_string_pretty(&report.registers)?);
            println!("audit: {}", report.verification_summary);
            println!("metrics: {}", report.metrics_summary);
            println!("distributed: {}", report.is_distributed);
            println!("offline_nodes_swept: {:?}", report.offline_nodes_swept);
        }
        Commands::Components => {
            for (id, description) in COMPONENTS {
                println!("{id}: {description}");
            }
        }
    }

    Ok(())
}
