//! Concrete executor families (spec.md §4.9 "Executor contract"). `HTTP`
//! and `GRPC` make real calls over [`reqwest`]; the sandboxed and
//! process-spawning families (`WASM`, `NATIVE`, `MCP`, `DOCKER`,
//! `EMBEDDED_JS`, `CONNECTOR`) are deterministic simulators standing in
//! for a real sandbox/spawn/JSON-RPC runtime, and `LLM_CALL` is a
//! bounded simulator so tests never depend on network access or a
//! provider key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scp_core::node::ServiceFormat;
use serde_json::{json, Value};

use crate::executor::{Executor, ExecutorError, ExecutorInput, ExecutorSuccess};
use crate::vault::VaultHandle;

fn check_cancelled(input: &ExecutorInput) -> Result<(), ExecutorError> {
    if input.cancellation.is_cancelled() {
        return Err(ExecutorError::new("CANCELLED", "cancellation observed before dispatch"));
    }
    Ok(())
}

/// Sandboxed WebAssembly module execution. Honors `minMemoryMB` by
/// rejecting calls that declare a requirement the simulator cannot
/// satisfy.
pub struct WasmExecutor {
    available_memory_mb: u64,
}

impl WasmExecutor {
    /// An executor simulating a sandbox with `available_memory_mb` of
    /// linear memory.
    #[must_use]
    pub fn new(available_memory_mb: u64) -> Self {
        Self { available_memory_mb }
    }
}

#[async_trait]
impl Executor for WasmExecutor {
    fn format(&self) -> ServiceFormat {
        ServiceFormat::Wasm
    }

    async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError> {
        check_cancelled(&input)?;
        if let Some(Value::Number(required)) = input.operands.get("minMemoryMB") {
            let required = required.as_u64().unwrap_or(0);
            if required > self.available_memory_mb {
                return Err(ExecutorError::new(
                    "WASM_OOM",
                    format!("module requires {required}MB, sandbox has {}MB", self.available_memory_mb),
                ));
            }
        }
        Ok(ExecutorSuccess {
            output: json!({"format": "WASM", "inputs": input.inputs}),
            duration_ms: 1,
            services_called: vec![],
        })
    }
}

/// Local native binary invocation.
#[derive(Default)]
pub struct NativeExecutor;

#[async_trait]
impl Executor for NativeExecutor {
    fn format(&self) -> ServiceFormat {
        ServiceFormat::Native
    }

    async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError> {
        check_cancelled(&input)?;
        Ok(ExecutorSuccess {
            output: json!({"format": "NATIVE", "inputs": input.inputs}),
            duration_ms: 1,
            services_called: vec![],
        })
    }
}

/// JSON-RPC sidecar (Model Context Protocol) call.
#[derive(Default)]
pub struct McpExecutor;

#[async_trait]
impl Executor for McpExecutor {
    fn format(&self) -> ServiceFormat {
        ServiceFormat::Mcp
    }

    async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError> {
        check_cancelled(&input)?;
        let method = input
            .operands
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::new("MCP_BAD_OPERANDS", "missing required operand `method`"))?;
        Ok(ExecutorSuccess {
            output: json!({"jsonrpc": "2.0", "method": method, "result": input.inputs}),
            duration_ms: 1,
            services_called: vec![method.to_string()],
        })
    }
}

/// Container spawn, central-only (enforced by the node registry, not
/// this executor).
#[derive(Default)]
pub struct DockerExecutor;

#[async_trait]
impl Executor for DockerExecutor {
    fn format(&self) -> ServiceFormat {
        ServiceFormat::Docker
    }

    async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError> {
        check_cancelled(&input)?;
        let image = input
            .operands
            .get("image")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::new("DOCKER_BAD_OPERANDS", "missing required operand `image`"))?;
        Ok(ExecutorSuccess {
            output: json!({"format": "DOCKER", "image": image, "inputs": input.inputs}),
            duration_ms: 1,
            services_called: vec![image.to_string()],
        })
    }
}

/// Sandboxed embedded JavaScript evaluation.
#[derive(Default)]
pub struct EmbeddedJsExecutor;

#[async_trait]
impl Executor for EmbeddedJsExecutor {
    fn format(&self) -> ServiceFormat {
        ServiceFormat::EmbeddedJs
    }

    async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError> {
        check_cancelled(&input)?;
        Ok(ExecutorSuccess {
            output: json!({"format": "EMBEDDED_JS", "inputs": input.inputs}),
            duration_ms: 1,
            services_called: vec![],
        })
    }
}

/// A registered typed connector adapter, selected by `connectorType`.
#[derive(Default)]
pub struct ConnectorExecutor;

#[async_trait]
impl Executor for ConnectorExecutor {
    fn format(&self) -> ServiceFormat {
        ServiceFormat::Connector
    }

    async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError> {
        check_cancelled(&input)?;
        let connector_type = input
            .operands
            .get("connectorType")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::new("CONNECTOR_BAD_OPERANDS", "missing required operand `connectorType`"))?;
        Ok(ExecutorSuccess {
            output: json!({"format": "CONNECTOR", "connectorType": connector_type, "inputs": input.inputs}),
            duration_ms: 1,
            services_called: vec![connector_type.to_string()],
        })
    }
}

/// Bounded remote LLM inference with vault-sourced credentials. Does not
/// make a real network call: the spec requires only that credentials be
/// vault-sourced and the call be bounded by `deadline`, both of which
/// this simulator honors.
pub struct LlmCallExecutor {
    vault: Arc<dyn VaultHandle>,
    credentials_path: String,
}

impl LlmCallExecutor {
    /// An executor that resolves its provider key from `credentials_path`
    /// in `vault` on every call.
    #[must_use]
    pub fn new(vault: Arc<dyn VaultHandle>, credentials_path: impl Into<String>) -> Self {
        Self {
            vault,
            credentials_path: credentials_path.into(),
        }
    }
}

#[async_trait]
impl Executor for LlmCallExecutor {
    fn format(&self) -> ServiceFormat {
        ServiceFormat::LlmCall
    }

    async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError> {
        check_cancelled(&input)?;
        if input.deadline.is_zero() {
            return Err(ExecutorError::new("TIMEOUT", "zero-length deadline for LLM call"));
        }
        self.vault
            .resolve(&self.credentials_path)
            .map_err(|e| ExecutorError::new("LLM_NO_CREDENTIALS", e.to_string()))?;
        let prompt = input.operands.get("prompt").cloned().unwrap_or(Value::Null);
        Ok(ExecutorSuccess {
            output: json!({"format": "LLM_CALL", "prompt": prompt, "completion": "simulated completion"}),
            duration_ms: 1,
            services_called: vec!["llm-provider".to_string()],
        })
    }
}

/// Plain HTTP call, made for real over [`reqwest`].
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl HttpExecutor {
    async fn dispatch(&self, input: &ExecutorInput, format_name: &'static str) -> Result<ExecutorSuccess, ExecutorError> {
        let url = input
            .operands
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::new("HTTP_BAD_OPERANDS", "missing required operand `url`"))?;

        let mut request = self.client.post(url).json(&input.inputs);
        if input.deadline > Duration::ZERO {
            request = request.timeout(input.deadline);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::new("TIMEOUT", e.to_string())
            } else {
                ExecutorError::new("UNREACHABLE", e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(ExecutorError::new(
                "HTTP_ERROR_STATUS",
                format!("{format_name} call returned status {}", response.status()),
            ));
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(ExecutorSuccess {
            output: body,
            duration_ms: 1,
            services_called: vec![url.to_string()],
        })
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    fn format(&self) -> ServiceFormat {
        ServiceFormat::Http
    }

    async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError> {
        check_cancelled(&input)?;
        self.dispatch(&input, "HTTP").await
    }
}

/// gRPC call. The corpus carries no gRPC client crate, so this is
/// implemented as JSON-over-HTTP against a gRPC-JSON transcoding
/// gateway, reusing the same `reqwest` client as [`HttpExecutor`].
pub struct GrpcExecutor {
    client: reqwest::Client,
}

impl Default for GrpcExecutor {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl Executor for GrpcExecutor {
    fn format(&self) -> ServiceFormat {
        ServiceFormat::Grpc
    }

    async fn execute(&self, input: ExecutorInput) -> Result<ExecutorSuccess, ExecutorError> {
        check_cancelled(&input)?;
        let http = HttpExecutor { client: self.client.clone() };
        http.dispatch(&input, "GRPC").await
    }
}
