//! Core domain types for chatflow - no IO, no async.
//!
//! Everything here is a plain value type shared between the pipeline crates:
//! tool-call lifecycle states, stream events, user identity/tier, and the
//! error taxonomy. Components that do work (buffers, caches, admission
//! control, orchestration) live in `chatflow-core` and `chatflow-engine`.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

// ============================================================================
// Users
// ============================================================================

/// Opaque user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subscription tier. Ordering matters: a higher tier satisfies any
/// requirement expressed as a lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    Free,
    Plus,
}

impl UserTier {
    /// Whether this tier satisfies `required`.
    #[must_use]
    pub fn meets(self, required: UserTier) -> bool {
        self >= required
    }

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::Plus => "Plus",
        }
    }
}

// ============================================================================
// Tool Definitions
// ============================================================================

/// Definition of a tool that can be called by the model.
///
/// This follows the standard function calling schema: a name, a description,
/// and a JSON Schema for the parameters. Schema *validation* is a collaborator
/// concern; the pipeline only transports the schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The name of the tool (function name).
    pub name: String,
    /// A description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

// ============================================================================
// Tool Call Lifecycle
// ============================================================================

/// Lifecycle state of a single tool invocation.
///
/// The state graph is directed and acyclic; `Result` and `Error` are
/// terminal. A call may originate directly in `Call` when the stream
/// delivers complete arguments atomically (no partial phase observed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallState {
    /// Arguments are still streaming in.
    PartialCall,
    /// Arguments are finalized; execution has not begun.
    Call,
    /// The executor is running.
    Executing,
    /// Execution succeeded (terminal).
    Result,
    /// Execution failed (terminal).
    Error,
}

impl ToolCallState {
    /// Position in the lifecycle, used to reject backward transitions.
    /// `Result` and `Error` share a rank: they are sibling terminals.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::PartialCall => 0,
            Self::Call => 1,
            Self::Executing => 2,
            Self::Result | Self::Error => 3,
        }
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Self-transitions are allowed only for `PartialCall` (more argument
    /// deltas arriving). Terminal states admit no transitions at all.
    #[must_use]
    pub fn can_transition_to(self, next: ToolCallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return self == Self::PartialCall;
        }
        next.rank() > self.rank()
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Result | Self::Error)
    }
}

impl fmt::Display for ToolCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PartialCall => "partial-call",
            Self::Call => "call",
            Self::Executing => "executing",
            Self::Result => "result",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A tool call requested by the model.
///
/// Owned by the tool-call executor for the duration of the call. The
/// `arguments` value may be partial while `state` is [`ToolCallState::PartialCall`].
/// The `error` field is populated only on the failure path, as a secondary
/// notification channel alongside the terminal [`ToolResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call within a response.
    pub id: String,
    /// The name of the tool being called.
    pub name: String,
    /// The arguments, as parsed JSON (possibly partial).
    pub arguments: serde_json::Value,
    /// Current lifecycle state.
    pub state: ToolCallState,
    /// When this call was first observed.
    pub created_at: SystemTime,
    /// Error message, set when the call transitions to `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCall {
    /// Create a call in `PartialCall` state (arguments still streaming).
    pub fn partial(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            state: ToolCallState::PartialCall,
            created_at: SystemTime::now(),
            error: None,
        }
    }

    /// Create a call directly in `Call` state (complete arguments).
    pub fn complete(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            state: ToolCallState::Call,
            created_at: SystemTime::now(),
            error: None,
        }
    }
}

// ============================================================================
// Tool Results
// ============================================================================

/// Terminal outcome of a tool execution.
///
/// A real sum type rather than sibling `result`/`error` fields, so the error
/// path is statically checkable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOutcome {
    /// The tool produced a value.
    Success(serde_json::Value),
    /// The tool's executor failed; carries the error message.
    Error(String),
}

impl ToolOutcome {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    #[must_use]
    pub fn as_success(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Success(value) => Some(value),
            Self::Error(_) => None,
        }
    }
}

/// The result of executing a tool call.
///
/// Created exactly once per call upon completion; immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The ID of the tool call this result is for.
    pub tool_call_id: String,
    /// The name of the tool that was called.
    pub tool_name: String,
    /// The arguments the tool was invoked with.
    pub arguments: serde_json::Value,
    /// Success or error outcome.
    pub outcome: ToolOutcome,
    /// Wall-clock execution time. Always recorded, even on failure.
    pub execution_time: Duration,
}

impl ToolResult {
    /// Create a successful tool result.
    pub fn success(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        value: serde_json::Value,
        execution_time: Duration,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            outcome: ToolOutcome::Success(value),
            execution_time,
        }
    }

    /// Create an error tool result.
    pub fn error(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        message: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            outcome: ToolOutcome::Error(message.into()),
            execution_time,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.outcome.is_error()
    }
}

/// Event emitted by the tool-call executor as a call progresses.
///
/// Consumers must handle both channels: `Updated` fires on every state
/// transition (including the error-carrying update on the failure path),
/// `Result` fires exactly once per execution.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    /// A call changed state (or received more partial arguments).
    Updated(ToolCall),
    /// A call reached a terminal outcome.
    Result(ToolResult),
}

// ============================================================================
// Streaming Events
// ============================================================================

/// Streaming event from the model provider.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Answer text delta.
    TextDelta(String),
    /// Reasoning narration delta.
    ReasoningDelta(String),
    /// Tool call started - arguments will stream in as deltas.
    ToolCallStart { id: String, name: String },
    /// Tool call arguments delta - a fragment of the JSON argument string.
    ToolCallDelta { id: String, arguments: String },
    /// Tool call arguments are complete; the call may be executed.
    ToolCallEnd { id: String },
    /// Stream completed.
    Done,
    /// Error occurred.
    Error(String),
}

/// Reason a stream finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFinishReason {
    Done,
    Cancelled,
    Error(String),
}

/// An attachment sent alongside a completion request.
///
/// The pipeline never reads attachment bytes; it only inspects the declared
/// content type to route document-processing failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// File name, for diagnostics.
    pub name: String,
    /// Declared MIME type (e.g. `application/pdf`).
    pub content_type: String,
}

// ============================================================================
// Errors
// ============================================================================

/// Admission-control rejection: user-facing and non-retryable without an
/// out-of-band action (upgrade, or wait for the daily reset).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error(
        "{} subscription required: this feature is only available to {} subscribers. \
         Upgrade to access it.",
        required.display_name(),
        required.display_name()
    )]
    PremiumRequired { required: UserTier },

    #[error("Daily limit reached ({used}/{limit}). Limit resets at midnight UTC.")]
    QuotaExceeded { used: u32, limit: u32 },
}

/// Tool-level failure.
///
/// `Clone` so a single upstream failure can be propagated to every caller
/// awaiting the same deduplicated in-flight computation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("invalid tool arguments: {message}")]
    BadArgs { message: String },

    #[error("tool arguments exceeded maximum size ({max_bytes} bytes)")]
    ArgumentsTooLarge { max_bytes: usize },

    #[error("{message}")]
    ExecutionFailed { message: String },
}

impl ToolError {
    /// Wrap an arbitrary executor failure.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }
}
