//! Built-in handlers for the non-service opcodes (spec.md §4.9:
//! "`TRANSFORM/FILTER/AGGREGATE/VALIDATE/LOAD_RESOURCE/STORE_MEMORY/
//! PARALLEL_SPAWN/EVENT_STATE_MACHINE/HANDLE_*/REMOTE_COMMAND`"). These
//! run in-process, synchronously, with no executor dispatch —
//! `PARALLEL_SPAWN` is the one exception, handled by the run loop in
//! [`crate::Vm`] because it needs to fan out over sibling instructions.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::{json, Value};

use crate::executor::ExecutorError;
use crate::vault::VaultHandle;

/// Workflow-scoped key/value memory, distinct from the per-slice
/// register file (`STORE_MEMORY` outlives the instruction that wrote
/// it, for the life of the workflow run).
#[derive(Default)]
pub struct WorkflowMemory {
    values: RwLock<BTreeMap<String, Value>>,
}

impl WorkflowMemory {
    /// An empty memory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, overwriting any prior value.
    pub fn put(&self, key: &str, value: Value) {
        self.values.write().expect("memory lock poisoned").insert(key.to_string(), value);
    }

    /// Read the value stored at `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().expect("memory lock poisoned").get(key).cloned()
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// `TRANSFORM`: apply a pure data transform to `inputs`.
pub fn transform(expression: &str, params: &BTreeMap<String, Value>, inputs: &[Value]) -> Result<Value, ExecutorError> {
    match expression {
        "identity" => Ok(inputs.first().cloned().unwrap_or(Value::Null)),
        "multiply" => {
            let factor = params.get("factor").and_then(as_f64).unwrap_or(1.0);
            let value = inputs.first().and_then(as_f64).ok_or_else(|| {
                ExecutorError::new("TRANSFORM_BAD_INPUT", "`multiply` requires a numeric input")
            })?;
            Ok(json!(value * factor))
        }
        "add" => {
            let addend = params.get("addend").and_then(as_f64).unwrap_or(0.0);
            let value = inputs.first().and_then(as_f64).ok_or_else(|| {
                ExecutorError::new("TRANSFORM_BAD_INPUT", "`add` requires a numeric input")
            })?;
            Ok(json!(value + addend))
        }
        "concat" => {
            let joined: String = inputs.iter().map(value_to_display_string).collect();
            Ok(Value::String(joined))
        }
        other => Err(ExecutorError::new("TRANSFORM_UNKNOWN_EXPRESSION", format!("unknown transform expression `{other}`"))),
    }
}

/// `FILTER`: evaluate a predicate, returning `true`/`false` rather than
/// short-circuiting — the planner decides what a `false` result means
/// for the consuming instruction.
pub fn filter(predicate: &str, params: &BTreeMap<String, Value>, inputs: &[Value]) -> Result<Value, ExecutorError> {
    let value = inputs.first().and_then(as_f64);
    let threshold = params.get("threshold").and_then(as_f64).unwrap_or(0.0);
    let result = match (predicate, value) {
        ("gt", Some(v)) => v > threshold,
        ("lt", Some(v)) => v < threshold,
        ("gte", Some(v)) => v >= threshold,
        ("lte", Some(v)) => v <= threshold,
        ("eq", Some(v)) => (v - threshold).abs() < f64::EPSILON,
        (other, _) if !["gt", "lt", "gte", "lte", "eq"].contains(&other) => {
            return Err(ExecutorError::new("FILTER_UNKNOWN_PREDICATE", format!("unknown filter predicate `{other}`")))
        }
        _ => {
            return Err(ExecutorError::new("FILTER_BAD_INPUT", "filter predicate requires a numeric input"))
        }
    };
    Ok(Value::Bool(result))
}

/// `AGGREGATE`: reduce `inputs` into one value.
pub fn aggregate(function: &str, inputs: &[Value]) -> Result<Value, ExecutorError> {
    match function {
        "sum" => {
            let total: f64 = inputs.iter().filter_map(as_f64).sum();
            Ok(json!(total))
        }
        "collect" => Ok(Value::Array(inputs.to_vec())),
        "concat" => Ok(Value::String(inputs.iter().map(value_to_display_string).collect())),
        other => Err(ExecutorError::new("AGGREGATE_UNKNOWN_FUNCTION", format!("unknown aggregate function `{other}`"))),
    }
}

/// `VALIDATE`: check `inputs[0]`'s JSON type against `schema.type`
/// (a deliberately minimal subset of JSON Schema; full schema
/// validation is out of scope per spec.md's non-goals).
pub fn validate(schema: &Value, inputs: &[Value]) -> Result<Value, ExecutorError> {
    let Some(expected_type) = schema.get("type").and_then(Value::as_str) else {
        return Ok(Value::Bool(true));
    };
    let actual = inputs.first().unwrap_or(&Value::Null);
    let matches = match expected_type {
        "string" => actual.is_string(),
        "number" => actual.is_number(),
        "boolean" => actual.is_boolean(),
        "object" => actual.is_object(),
        "array" => actual.is_array(),
        "null" => actual.is_null(),
        _ => true,
    };
    if matches {
        Ok(Value::Bool(true))
    } else {
        Err(ExecutorError::new(
            "VALIDATE_TYPE_MISMATCH",
            format!("expected type `{expected_type}`, got `{actual}`"),
        ))
    }
}

/// `LOAD_RESOURCE`: resolve a `vault://`, `memory://`, or opaque
/// resource URI into a register value.
pub fn load_resource(uri: &str, vault: &dyn VaultHandle, memory: &WorkflowMemory) -> Result<Value, ExecutorError> {
    if let Some(path) = uri.strip_prefix("vault://") {
        return vault
            .resolve(path)
            .map(Value::String)
            .map_err(|e| ExecutorError::new("LOAD_RESOURCE_VAULT_MISS", e.to_string()));
    }
    if let Some(key) = uri.strip_prefix("memory://") {
        return Ok(memory.get(key).unwrap_or(Value::Null));
    }
    Ok(json!({"uri": uri, "loaded": true}))
}

/// `STORE_MEMORY`: persist `value` under `key` for the life of the
/// workflow run.
pub fn store_memory(key: &str, value: Value, memory: &WorkflowMemory) -> Value {
    memory.put(key, value.clone());
    value
}

/// `EVENT_STATE_MACHINE`: an edge-local FSM step. The internal
/// transition semantics are left open by the spec (§9 open questions);
/// this emits a deterministic placeholder propagated-event shape so the
/// opcode's placement and routing can be exercised end to end.
pub fn event_state_machine(machine_id: &str, inputs: &[Value]) -> Value {
    json!({
        "machineId": machine_id,
        "event": inputs.first().cloned().unwrap_or(Value::Null),
    })
}

/// `HANDLE_PROPAGATED`: central's receipt of an edge FSM's propagated
/// event.
pub fn handle_propagated(machine_id: &str, inputs: &[Value]) -> Value {
    json!({
        "machineId": machine_id,
        "received": inputs.first().cloned().unwrap_or(Value::Null),
    })
}

/// `REMOTE_COMMAND`: central addresses a command to a specific node.
/// Delivering it is the dispatcher's job (see `scp-dispatcher`); this
/// only produces the value the orchestrator hands off.
pub fn remote_command(target_node_id: &str, command: &Value) -> Value {
    json!({"targetNodeId": target_node_id, "command": command})
}

/// `HANDLE_REMOTE_CMD`: a remote node's receipt of a command issued by
/// `REMOTE_COMMAND`.
pub fn handle_remote_cmd(target_node_id: &str, inputs: &[Value]) -> Value {
    json!({"targetNodeId": target_node_id, "command": inputs.first().cloned().unwrap_or(Value::Null), "acknowledged": true})
}

fn value_to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::InMemoryVault;

    #[test]
    fn multiply_scales_its_input() {
        let mut params = BTreeMap::new();
        params.insert("factor".to_string(), json!(2));
        let result = transform("multiply", &params, &[json!(21)]).unwrap();
        assert_eq!(result, json!(42.0));
    }

    #[test]
    fn unknown_transform_is_an_error() {
        let err = transform("bogus", &BTreeMap::new(), &[]).unwrap_err();
        assert_eq!(err.code, "TRANSFORM_UNKNOWN_EXPRESSION");
    }

    #[test]
    fn gt_filter_evaluates_numerically() {
        let mut params = BTreeMap::new();
        params.insert("threshold".to_string(), json!(60));
        assert_eq!(filter("gt", &params, &[json!(72)]).unwrap(), Value::Bool(true));
        assert_eq!(filter("gt", &params, &[json!(10)]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn sum_aggregates_numeric_inputs() {
        let result = aggregate("sum", &[json!(1), json!(2), json!(3.5)]).unwrap();
        assert_eq!(result, json!(6.5));
    }

    #[test]
    fn validate_rejects_type_mismatch() {
        let schema = json!({"type": "number"});
        let err = validate(&schema, &[json!("not a number")]).unwrap_err();
        assert_eq!(err.code, "VALIDATE_TYPE_MISMATCH");
    }

    #[test]
    fn validate_accepts_matching_type() {
        let schema = json!({"type": "number"});
        assert_eq!(validate(&schema, &[json!(5)]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn load_resource_resolves_vault_paths() {
        let vault = InMemoryVault::new();
        vault.put("secret/a", "hunter2");
        let memory = WorkflowMemory::new();
        let value = load_resource("vault://secret/a", &vault, &memory).unwrap();
        assert_eq!(value, json!("hunter2"));
    }

    #[test]
    fn store_then_load_round_trips_through_memory() {
        let vault = InMemoryVault::new();
        let memory = WorkflowMemory::new();
        store_memory("counter", json!(7), &memory);
        let value = load_resource("memory://counter", &vault, &memory).unwrap();
        assert_eq!(value, json!(7));
    }
}
