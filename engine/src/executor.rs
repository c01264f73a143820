//! Streaming tool-call execution.
//!
//! Providers deliver tool calls as a start marker, a series of argument
//! fragments, and an end marker. [`StreamingToolExecutor`] accumulates each
//! call, walks it through the lifecycle states, and emits [`ToolEvent`]s on
//! every transition. Per call it guarantees:
//!
//! - states only move forward (regressions are rejected and logged),
//! - exactly one [`ToolEvent::Result`] is emitted, success or failure,
//! - execution time is recorded on every result, including failures,
//! - the failure path emits both an error-carrying `Updated` event and the
//!   error result, so state-driven and result-driven consumers stay in sync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use chatflow_types::{ToolCall, ToolCallState, ToolError, ToolEvent, ToolResult};

use crate::tool::{ToolExecutor, ToolRegistry};

/// Routing hook: how a validated call's arguments reach the tool.
///
/// The orchestrator supplies a closure here to interpose deduplication or
/// admission checks; the identity routing is `|tool, args| tool.execute(args)`.
pub type ExecutionRoute = Box<
    dyn FnOnce(Arc<dyn ToolExecutor>, Value) -> BoxFuture<'static, Result<Value, ToolError>>
        + Send,
>;

struct TrackedCall {
    call: ToolCall,
    args_buf: String,
    args_exceeded: bool,
}

/// Accumulates streamed tool calls and turns them into executions.
pub struct StreamingToolExecutor {
    registry: Arc<ToolRegistry>,
    events: mpsc::UnboundedSender<ToolEvent>,
    calls: HashMap<String, TrackedCall>,
    max_args_bytes: usize,
}

impl std::fmt::Debug for StreamingToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingToolExecutor")
            .field("pending_calls", &self.calls.len())
            .field("max_args_bytes", &self.max_args_bytes)
            .finish_non_exhaustive()
    }
}

impl StreamingToolExecutor {
    #[must_use]
    pub fn new(
        registry: Arc<ToolRegistry>,
        events: mpsc::UnboundedSender<ToolEvent>,
        max_args_bytes: usize,
    ) -> Self {
        Self {
            registry,
            events,
            calls: HashMap::new(),
            max_args_bytes,
        }
    }

    /// Start tracking a call. Emits a `PartialCall` update.
    pub fn begin_call(&mut self, id: &str, name: &str) {
        if self.calls.contains_key(id) {
            tracing::warn!(id, "duplicate tool call start ignored");
            return;
        }
        let call = ToolCall::partial(id, name, Value::Null);
        emit(&self.events, ToolEvent::Updated(call.clone()));
        self.calls.insert(
            id.to_string(),
            TrackedCall {
                call,
                args_buf: String::new(),
                args_exceeded: false,
            },
        );
    }

    /// Append an argument fragment. Emits a `PartialCall` update carrying the
    /// raw accumulated argument text; the parsed JSON replaces it once the
    /// call finishes.
    pub fn append_arguments(&mut self, id: &str, fragment: &str) {
        let Some(tracked) = self.calls.get_mut(id) else {
            tracing::warn!(id, "argument delta for unknown tool call ignored");
            return;
        };
        if tracked.args_exceeded {
            return;
        }
        if tracked.args_buf.len().saturating_add(fragment.len()) > self.max_args_bytes {
            tracing::warn!(
                id,
                max_bytes = self.max_args_bytes,
                "tool call arguments exceeded size cap; discarding remainder"
            );
            tracked.args_exceeded = true;
            return;
        }
        tracked.args_buf.push_str(fragment);
        tracked.call.arguments = Value::String(tracked.args_buf.clone());
        emit(&self.events, ToolEvent::Updated(tracked.call.clone()));
    }

    /// Finalize a call and produce its execution future.
    ///
    /// Validation failures (oversized or malformed arguments, unknown tool)
    /// are resolved here without invoking any executor: the call jumps to
    /// `Error` and the returned future yields the error result immediately.
    /// For valid calls the call advances to `Call` now; the returned future
    /// advances it through `Executing` to a terminal state when awaited.
    pub fn finish_call(
        &mut self,
        id: &str,
        route: ExecutionRoute,
    ) -> Option<BoxFuture<'static, ToolResult>> {
        let Some(mut tracked) = self.calls.remove(id) else {
            tracing::warn!(id, "finish for unknown tool call ignored");
            return None;
        };

        if tracked.args_exceeded {
            let error = ToolError::ArgumentsTooLarge {
                max_bytes: self.max_args_bytes,
            };
            return Some(self.resolve_without_execution(tracked.call, error));
        }

        let arguments: Value = if tracked.args_buf.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str(&tracked.args_buf) {
                Ok(value) => value,
                Err(e) => {
                    let error = ToolError::BadArgs {
                        message: e.to_string(),
                    };
                    return Some(self.resolve_without_execution(tracked.call, error));
                }
            }
        };
        tracked.call.arguments = arguments.clone();

        let Some(tool) = self.registry.get(&tracked.call.name) else {
            let error = ToolError::UnknownTool {
                name: tracked.call.name.clone(),
            };
            return Some(self.resolve_without_execution(tracked.call, error));
        };

        let mut call = tracked.call;
        advance(&mut call, ToolCallState::Call);
        emit(&self.events, ToolEvent::Updated(call.clone()));

        let events = self.events.clone();
        Some(
            async move {
                advance(&mut call, ToolCallState::Executing);
                emit(&events, ToolEvent::Updated(call.clone()));

                let started = Instant::now();
                let outcome = route(tool, arguments.clone()).await;
                let elapsed = started.elapsed();

                let result = match outcome {
                    Ok(value) => {
                        advance(&mut call, ToolCallState::Result);
                        emit(&events, ToolEvent::Updated(call.clone()));
                        ToolResult::success(&call.id, &call.name, arguments, value, elapsed)
                    }
                    Err(e) => {
                        call.error = Some(e.to_string());
                        advance(&mut call, ToolCallState::Error);
                        emit(&events, ToolEvent::Updated(call.clone()));
                        ToolResult::error(&call.id, &call.name, arguments, e.to_string(), elapsed)
                    }
                };
                emit(&events, ToolEvent::Result(result.clone()));
                result
            }
            .boxed(),
        )
    }

    /// Number of calls still accumulating arguments.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    /// Resolve a call that failed validation before any executor ran.
    /// Execution time is recorded as zero; no tool was invoked.
    fn resolve_without_execution(
        &self,
        mut call: ToolCall,
        error: ToolError,
    ) -> BoxFuture<'static, ToolResult> {
        let message = error.to_string();
        call.error = Some(message.clone());
        advance(&mut call, ToolCallState::Error);
        emit(&self.events, ToolEvent::Updated(call.clone()));

        let result = ToolResult::error(
            &call.id,
            &call.name,
            call.arguments.clone(),
            message,
            Duration::ZERO,
        );
        emit(&self.events, ToolEvent::Result(result.clone()));
        futures_util::future::ready(result).boxed()
    }
}

/// Apply a transition, refusing anything the lifecycle graph forbids.
fn advance(call: &mut ToolCall, next: ToolCallState) {
    if call.state.can_transition_to(next) {
        call.state = next;
    } else {
        tracing::warn!(
            id = %call.id,
            from = %call.state,
            to = %next,
            "illegal tool call state transition rejected"
        );
    }
}

fn emit(events: &mpsc::UnboundedSender<ToolEvent>, event: ToolEvent) {
    if events.send(event).is_err() {
        tracing::debug!("tool event receiver dropped");
    }
}
