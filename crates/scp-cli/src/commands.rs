//! Shared command implementations for the SCP CLI.
//!
//! These functions are library-level so they can be exercised without
//! spawning the binary.

use anyhow::{Context, Result};
use schemars::schema_for;
use scp_core::audit::AuditEvent;
use scp_core::capability::CapabilityEntry;
use scp_core::ir::IrInstruction;
use scp_core::node::NodeCapability;
use scp_core::slice::DistributionPlan;

/// Schema types that can be printed by the `schema` subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// JSON schema for [`IrInstruction`].
    Instruction,
    /// JSON schema for [`CapabilityEntry`].
    Capability,
    /// JSON schema for [`DistributionPlan`].
    DistributionPlan,
    /// JSON schema for [`AuditEvent`].
    AuditEvent,
    /// JSON schema for [`NodeCapability`].
    Node,
}

/// Return the pretty-printed JSON schema string for the given kind.
pub fn schema_json(kind: SchemaKind) -> Result<String> {
    let value = match kind {
        SchemaKind::Instruction => serde_json::to_value(schema_for!(IrInstruction))?,
        SchemaKind::Capability => serde_json::to_value(schema_for!(CapabilityEntry))?,
        SchemaKind::DistributionPlan => serde_json::to_value(schema_for!(DistributionPlan))?,
        SchemaKind::AuditEvent => serde_json::to_value(schema_for!(AuditEvent))?,
        SchemaKind::Node => serde_json::to_value(schema_for!(NodeCapability))?,
    };
    serde_json::to_string_pretty(&value).context("serialize schema")
}
