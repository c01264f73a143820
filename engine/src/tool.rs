//! Tool executor trait and registry.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use chatflow_types::{ToolDefinition, ToolError};

use crate::errors::EngineError;

/// An executable tool exposed to the model.
///
/// The two policy hooks decide how the orchestrator routes an invocation:
/// cache-eligible tools (read-only, deterministic over short windows, e.g.
/// web search) go through the deduplication cache; admission-gated tools
/// (expensive resources, e.g. the code sandbox) pass tier and quota checks
/// first. A tool must not claim both - caching would let one user's run
/// satisfy another user's quota-gated request.
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> Value;

    /// Whether identical concurrent or recent invocations may share a result.
    fn cache_eligible(&self) -> bool {
        false
    }

    /// Whether invocations must pass tier and daily-quota checks.
    fn requires_admission(&self) -> bool {
        false
    }

    /// Run the tool. `arguments` has already been validated as JSON; schema
    /// conformance is the executor's concern.
    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<Value, ToolError>>;
}

/// Registry of available tools, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Duplicate names are rejected rather than silently
    /// replaced - two tools answering to one name is a wiring bug.
    pub fn register(&mut self, tool: Arc<dyn ToolExecutor>) -> Result<(), EngineError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(EngineError::DuplicateTool { name });
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).cloned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions for every registered tool, sorted by name so the request
    /// payload is deterministic.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.parameters()))
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use serde_json::{Value, json};

    use chatflow_types::ToolError;

    use super::ToolExecutor;

    /// Test tool that echoes its arguments, optionally failing or delaying.
    pub struct MockTool {
        pub name: String,
        pub cache_eligible: bool,
        pub requires_admission: bool,
        pub fail_with: Option<String>,
        pub delay: Option<Duration>,
        pub calls: Arc<AtomicUsize>,
    }

    impl MockTool {
        pub fn named(name: &str) -> Self {
            Self {
                name: name.to_string(),
                cache_eligible: false,
                requires_admission: false,
                fail_with: None,
                delay: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn cacheable(name: &str) -> Self {
            Self {
                cache_eligible: true,
                ..Self::named(name)
            }
        }

        pub fn admission_gated(name: &str) -> Self {
            Self {
                requires_admission: true,
                ..Self::named(name)
            }
        }

        pub fn failing(name: &str, message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                ..Self::named(name)
            }
        }
    }

    impl ToolExecutor for MockTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "test tool"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }

        fn cache_eligible(&self) -> bool {
            self.cache_eligible
        }

        fn requires_admission(&self) -> bool {
            self.requires_admission
        }

        fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<Value, ToolError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail_with = self.fail_with.clone();
            let delay = self.delay;
            async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                match fail_with {
                    Some(message) => Err(ToolError::execution(message)),
                    None => Ok(json!({"echo": arguments})),
                }
            }
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::test_support::MockTool;
    use super::ToolRegistry;

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool::named("search"))).unwrap();
        assert!(registry.register(Arc::new(MockTool::named("search"))).is_err());
        assert!(registry.get("search").is_some());
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(MockTool::named("zeta"))).unwrap();
        registry.register(Arc::new(MockTool::named("alpha"))).unwrap();
        registry.register(Arc::new(MockTool::named("mid"))).unwrap();

        let names: Vec<String> = registry
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }
}
