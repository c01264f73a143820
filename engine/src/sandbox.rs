//! Sandboxed code execution.
//!
//! The provider trait is the seam to whatever actually hosts the sandbox
//! (a microVM fleet, a container pool). [`SandboxTool`] adapts a provider to
//! the tool interface and marks itself admission-gated, so every invocation
//! passes tier and daily-quota checks before the provider is touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use chatflow_types::ToolError;

use crate::tool::ToolExecutor;

pub const SANDBOX_TOOL_NAME: &str = "code_sandbox";

/// One sandbox run: files to materialize, then an optional command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxRequest {
    /// Path to file-content map, written before the command runs.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Command to execute inside the sandbox.
    #[serde(default)]
    pub command: Option<String>,
    /// Port to expose; when set, the run result carries a preview URL.
    #[serde(default)]
    pub port: Option<u16>,
}

/// Outcome of a sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Preview URL for the exposed port, when one was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_url: Option<String>,
}

/// Backend that hosts sandboxed executions.
pub trait SandboxProvider: Send + Sync {
    /// Allocate a sandbox, write the request's files, run its command, and
    /// tear the sandbox down. A non-zero exit code is a successful run with
    /// a failing program; `Err` means the sandbox itself failed.
    fn run(&self, request: SandboxRequest) -> BoxFuture<'static, Result<SandboxRun, ToolError>>;
}

/// Tool adapter over a [`SandboxProvider`].
pub struct SandboxTool {
    provider: Arc<dyn SandboxProvider>,
}

impl SandboxTool {
    #[must_use]
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self { provider }
    }
}

impl ToolExecutor for SandboxTool {
    fn name(&self) -> &str {
        SANDBOX_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Execute code in an isolated sandbox. Write files, run a command, \
         and optionally expose a port for a live preview."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "object",
                    "description": "Map of file path to file content",
                    "additionalProperties": { "type": "string" }
                },
                "command": {
                    "type": "string",
                    "description": "Shell command to run after files are written"
                },
                "port": {
                    "type": "integer",
                    "description": "Port to expose as a preview URL"
                }
            }
        })
    }

    fn requires_admission(&self) -> bool {
        true
    }

    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<Value, ToolError>> {
        let request: SandboxRequest = match serde_json::from_value(arguments) {
            Ok(request) => request,
            Err(e) => {
                return futures_util::future::ready(Err(ToolError::BadArgs {
                    message: e.to_string(),
                }))
                .boxed();
            }
        };

        let provider = self.provider.clone();
        async move {
            let run = provider.run(request).await?;
            serde_json::to_value(&run).map_err(|e| ToolError::execution(e.to_string()))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use serde_json::json;

    use chatflow_types::ToolError;

    use super::{SandboxProvider, SandboxRequest, SandboxRun, SandboxTool};
    use crate::tool::ToolExecutor;

    struct RecordingProvider {
        seen: Arc<Mutex<Vec<SandboxRequest>>>,
    }

    impl SandboxProvider for RecordingProvider {
        fn run(
            &self,
            request: SandboxRequest,
        ) -> BoxFuture<'static, Result<SandboxRun, ToolError>> {
            self.seen.lock().unwrap().push(request.clone());
            let host_url = request.port.map(|p| format!("https://sandbox.test:{p}"));
            futures_util::future::ready(Ok(SandboxRun {
                stdout: "ok".to_string(),
                stderr: String::new(),
                exit_code: 0,
                host_url,
            }))
            .boxed()
        }
    }

    fn tool_with_recorder() -> (SandboxTool, Arc<Mutex<Vec<SandboxRequest>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let provider = RecordingProvider { seen: seen.clone() };
        (SandboxTool::new(Arc::new(provider)), seen)
    }

    #[tokio::test]
    async fn parses_arguments_and_forwards_to_provider() {
        let (tool, seen) = tool_with_recorder();

        let output = tool
            .execute(json!({
                "files": { "main.py": "print('hi')" },
                "command": "python main.py",
                "port": 8080
            }))
            .await
            .unwrap();

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].command.as_deref(), Some("python main.py"));
        assert_eq!(requests[0].files["main.py"], "print('hi')");

        assert_eq!(output["stdout"], "ok");
        assert_eq!(output["exit_code"], 0);
        assert_eq!(output["host_url"], "https://sandbox.test:8080");
    }

    #[tokio::test]
    async fn rejects_malformed_arguments_without_touching_the_provider() {
        let (tool, seen) = tool_with_recorder();

        let result = tool.execute(json!({"files": 42})).await;

        assert!(matches!(result, Err(ToolError::BadArgs { .. })));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn sandbox_tool_is_admission_gated_and_never_cached() {
        let (tool, _seen) = tool_with_recorder();
        assert!(tool.requires_admission());
        assert!(!tool.cache_eligible());
    }
}
