//! MCP server implementation using rmcp.
//!
//! Exposes the sandbox's three operations as MCP tools: `execute`,
//! `validate` and `get_limits`. Results are returned as JSON text.

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::request::ExecutionRequest;
use crate::service::Sandbox;

/// MCP server for sandboxed factor execution.
#[derive(Clone)]
pub struct SandboxServer {
    sandbox: Sandbox,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    #[schemars(description = "Python source of the factor to run")]
    pub code: String,

    #[schemars(description = "Wall-clock limit in seconds (see get_limits for bounds)")]
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[schemars(description = "Memory limit in MB (see get_limits for bounds)")]
    #[serde(default)]
    pub max_memory_mb: Option<u64>,

    #[schemars(description = "Variables injected into the code's namespace")]
    #[serde(default)]
    pub globals: Option<Map<String, Value>>,

    #[schemars(description = "Return the JSON-serializable variables the code defined")]
    #[serde(default)]
    pub capture_locals: bool,

    #[schemars(description = "Caller's identifier for audit logs")]
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl From<ExecuteParams> for ExecutionRequest {
    fn from(params: ExecuteParams) -> Self {
        Self {
            code: params.code,
            timeout_seconds: params.timeout_seconds,
            max_memory_mb: params.max_memory_mb,
            globals: params.globals.unwrap_or_default(),
            capture_locals: params.capture_locals,
            correlation_id: params.correlation_id,
        }
    }
}

/// Parameters for the validate tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ValidateParams {
    #[schemars(description = "Python source to analyze without running it")]
    pub code: String,
}

#[tool_router]
impl SandboxServer {
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox,
            tool_router: Self::tool_router(),
        }
    }

    /// Validate and run factor code in the sandbox.
    #[tool(description = "Run Python factor code in a restricted sandbox. Returns stdout, stderr, \
                          error_type/error_message on failure and optionally the resulting variables.")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = ExecutionRequest::from(params);
        info!(code_chars = request.code_chars(), "Executing code");

        match self.sandbox.execute(&request).await {
            Ok(result) => {
                let text = to_json(&result)?;
                if result.success {
                    Ok(CallToolResult::success(vec![Content::text(text)]))
                } else {
                    Ok(CallToolResult::error(vec![Content::text(text)]))
                }
            }
            Err(e) => {
                error!(error = %e, "Execution failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "Sandbox error: {e}"
                ))]))
            }
        }
    }

    /// Statically analyze factor code.
    #[tool(description = "Check Python factor code against the sandbox's import whitelist and \
                          call blacklist without running it.")]
    async fn validate(
        &self,
        Parameters(params): Parameters<ValidateParams>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.sandbox.validate(&params.code);
        Ok(CallToolResult::success(vec![Content::text(to_json(&result)?)]))
    }

    /// Report the accepted limits.
    #[tool(description = "Report the min, max and default timeout_seconds and max_memory_mb.")]
    async fn get_limits(&self) -> Result<CallToolResult, McpError> {
        let limits = self.sandbox.get_limits();
        Ok(CallToolResult::success(vec![Content::text(to_json(&limits)?)]))
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, McpError> {
    serde_json::to_string_pretty(value).map_err(|e| McpError::internal_error(e.to_string(), None))
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        let modules: Vec<_> = self.sandbox.config().registry.allowed_modules.clone();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "factor-sandbox".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Run user-authored Python factor code in a restricted sandbox.\n\
                 Importable modules: {modules:?}\n\
                 \n\
                 Use 'validate' to check code, 'execute' to run it and \
                 'get_limits' for the accepted timeout and memory bounds."
            )),
        }
    }
}

/// Serve the sandbox over stdio.
pub async fn serve_stdio(sandbox: Sandbox) -> anyhow::Result<()> {
    let server = SandboxServer::new(sandbox);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::Config;
    use crate::error::SandboxFault;
    use crate::isolation::{IsolatedJob, IsolationBoundary, RawExecutionOutcome, Termination};
    use async_trait::async_trait;

    struct EchoBoundary;

    #[async_trait]
    impl IsolationBoundary for EchoBoundary {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn run_isolated(&self, job: &IsolatedJob) -> Result<RawExecutionOutcome, SandboxFault> {
            Ok(RawExecutionOutcome {
                stdout: format!("executed: {}", job.request.code),
                stderr: String::new(),
                locals_snapshot: None,
                termination: Termination::Completed,
                peak_memory_kb: None,
                unavailable_modules: vec![],
            })
        }
    }

    fn server() -> SandboxServer {
        SandboxServer::new(Sandbox::with_boundary(Config::default(), Arc::new(EchoBoundary)))
    }

    fn execute_params(code: &str) -> Parameters<ExecuteParams> {
        Parameters(ExecuteParams {
            code: code.to_string(),
            timeout_seconds: None,
            max_memory_mb: None,
            globals: None,
            capture_locals: false,
            correlation_id: Some("req-1".into()),
        })
    }

    /// The JSON document carried by the first text content.
    fn payload(result: &CallToolResult) -> Value {
        let json = serde_json::to_value(result).unwrap();
        let text = json["content"][0]["text"].as_str().unwrap().to_string();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_execute_success() {
        let result = server().execute(execute_params("print('hello')")).await.unwrap();
        assert!(!result.is_error.unwrap_or(false));

        let body = payload(&result);
        assert_eq!(body["success"], true);
        assert_eq!(body["stdout"], "executed: print('hello')");
    }

    #[tokio::test]
    async fn test_execute_rejected() {
        let result = server()
            .execute(execute_params("import subprocess"))
            .await
            .unwrap();
        assert!(result.is_error.unwrap_or(false));
        assert_eq!(payload(&result)["error_type"], "SecurityError");
    }

    #[tokio::test]
    async fn test_validate() {
        let result = server()
            .validate(Parameters(ValidateParams {
                code: "eval('1+1')".into(),
            }))
            .await
            .unwrap();
        assert!(!result.is_error.unwrap_or(false));

        let body = payload(&result);
        assert_eq!(body["status"], "DANGEROUS");
        assert_eq!(body["is_safe"], false);
        assert_eq!(body["dangerous_calls"][0], "eval");
    }

    #[tokio::test]
    async fn test_get_limits() {
        let result = server().get_limits().await.unwrap();
        let body = payload(&result);
        assert_eq!(body["timeout"]["max"], 300);
        assert_eq!(body["memory_mb"]["default"], 512);
    }

    #[test]
    fn params_fill_request() {
        let params: ExecuteParams = serde_json::from_value(serde_json::json!({
            "code": "print(window)",
            "globals": {"window": 20},
            "capture_locals": true
        }))
        .unwrap();
        let request = ExecutionRequest::from(params);
        assert_eq!(request.globals["window"], 20);
        assert!(request.capture_locals);
        assert_eq!(request.timeout_seconds, None);
    }
}
