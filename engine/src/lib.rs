//! Completion engine: tool execution and response orchestration.
//!
//! The flow for one completion:
//!
//! 1. [`CompletionOrchestrator::run`] asks the [`ModelClient`] to stream.
//! 2. Text and reasoning deltas pass through per-channel chunk buffers
//!    (`chatflow-core`) and reach the consumer as sized flushes.
//! 3. Tool calls accumulate in the [`executor::StreamingToolExecutor`], then
//!    execute concurrently - deduplicated, admission-checked, or direct,
//!    per each tool's policy hooks.
//! 4. If tools succeeded but the model wrote no answer, a single fallback
//!    completion synthesizes one from the tool results.

pub mod config;
pub mod errors;
pub mod executor;
pub mod orchestrator;
pub mod sandbox;
pub mod tool;

pub use config::{BufferConfig, PipelineConfig, SandboxConfig};
pub use errors::EngineError;
pub use executor::StreamingToolExecutor;
pub use orchestrator::{
    AbortHandle, AbortRegistration, CompletionOrchestrator, CompletionOutcome, CompletionRequest,
    ModelClient, ResponseEvent,
};
pub use sandbox::{SandboxProvider, SandboxRequest, SandboxRun, SandboxTool};
pub use tool::{ToolExecutor, ToolRegistry};
