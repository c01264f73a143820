//! Completion orchestration.
//!
//! [`CompletionOrchestrator`] drives one completion end to end: it streams
//! model output through per-channel chunk buffers, routes tool calls through
//! deduplication or admission control according to each tool's policy, and
//! applies the fallback pass when tools produced results but the model wrote
//! no answer. Consumers observe the whole run as a single ordered
//! [`ResponseEvent`] stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{Abortable, BoxFuture};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

pub use futures_util::future::{AbortHandle, AbortRegistration};

use chatflow_core::{AdmissionController, ChunkBuffer, RequestCache};
use chatflow_types::{
    Attachment, StreamEvent, StreamFinishReason, ToolDefinition, ToolError, ToolEvent, ToolResult,
    UserId, UserTier,
};

use crate::config::{BufferConfig, PipelineConfig};
use crate::errors::EngineError;
use crate::executor::{ExecutionRoute, StreamingToolExecutor};
use crate::tool::ToolRegistry;

const STREAM_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub user_id: UserId,
    pub tier: UserTier,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl CompletionRequest {
    #[must_use]
    pub fn new(user_id: UserId, tier: UserTier, prompt: impl Into<String>) -> Self {
        Self {
            user_id,
            tier,
            prompt: prompt.into(),
            system_prompt: None,
            attachments: Vec::new(),
        }
    }
}

/// Event delivered to the response consumer.
///
/// Delta events carry both the flushed chunk and the full accumulated text
/// for the channel, so consumers can render incrementally or rebuild from
/// scratch after a dropped frame.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    AnswerDelta { chunk: String, full_text: String },
    ReasoningDelta { chunk: String, full_text: String },
    Tool(ToolEvent),
    Completed {
        answer: String,
        reasoning: String,
        finish: StreamFinishReason,
        used_fallback: bool,
    },
}

/// Final state of a completion run.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub answer: String,
    pub reasoning: String,
    pub tool_results: Vec<ToolResult>,
    pub finish: StreamFinishReason,
    pub used_fallback: bool,
}

/// Client for the model provider.
///
/// `stream` delivers the primary response as [`StreamEvent`]s; `complete` is
/// the non-streaming endpoint used only by the fallback pass.
pub trait ModelClient: Send + Sync {
    fn stream(
        &self,
        request: CompletionRequest,
        tools: Vec<ToolDefinition>,
        events: mpsc::Sender<StreamEvent>,
    ) -> BoxFuture<'static, anyhow::Result<()>>;

    fn complete(&self, prompt: String) -> BoxFuture<'static, anyhow::Result<String>>;
}

/// Drives completions: streaming, buffering, tool routing, fallback.
pub struct CompletionOrchestrator {
    client: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    cache: RequestCache<Value>,
    admission: Arc<AdmissionController>,
    config: PipelineConfig,
}

impl std::fmt::Debug for CompletionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CompletionOrchestrator {
    #[must_use]
    pub fn new(
        client: Arc<dyn ModelClient>,
        registry: Arc<ToolRegistry>,
        admission: Arc<AdmissionController>,
        config: PipelineConfig,
    ) -> Self {
        let cache = RequestCache::new(Duration::from_secs(config.cache_ttl_secs));
        Self {
            client,
            registry,
            cache,
            admission,
            config,
        }
    }

    /// Run one completion, delivering [`ResponseEvent`]s to `out`.
    ///
    /// Aborting via the handle paired with `abort` cancels the model stream;
    /// buffered text is still flushed and a `Completed` event with a
    /// `Cancelled` finish is emitted, but no fallback runs and pending tool
    /// executions are dropped without consuming quota.
    ///
    /// A stream-level failure still flushes buffers and emits `Completed`
    /// before returning the error, so consumers see a coherent event stream
    /// either way.
    pub async fn run(
        &self,
        request: CompletionRequest,
        out: mpsc::UnboundedSender<ResponseEvent>,
        abort: AbortRegistration,
    ) -> Result<CompletionOutcome, EngineError> {
        let (stream_tx, mut stream_rx) = mpsc::channel(STREAM_EVENT_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let tools = self.registry.definitions();
        let stream_request = request.clone();
        let stream_task = async move {
            if let Err(e) = client.stream(stream_request, tools, stream_tx.clone()).await {
                tracing::warn!("model streaming request failed: {e}");
                let _ = stream_tx.send(StreamEvent::Error(e.to_string())).await;
            }
        };
        tokio::spawn(async move {
            let _ = Abortable::new(stream_task, abort).await;
        });

        let mut reasoning = channel_buffer(
            &self.config.reasoning_buffer,
            out.clone(),
            Channel::Reasoning,
        );
        let mut answer = channel_buffer(&self.config.answer_buffer, out.clone(), Channel::Answer);

        let (tool_tx, mut tool_rx) = mpsc::unbounded_channel();
        let mut tool_executor = StreamingToolExecutor::new(
            self.registry.clone(),
            tool_tx,
            self.config.max_tool_args_bytes,
        );
        let mut executions: FuturesUnordered<BoxFuture<'static, ToolResult>> =
            FuturesUnordered::new();
        let mut results: Vec<ToolResult> = Vec::new();

        let finish = loop {
            tokio::select! {
                event = stream_rx.recv() => match event {
                    Some(StreamEvent::TextDelta(text)) => answer.add(&text),
                    Some(StreamEvent::ReasoningDelta(text)) => reasoning.add(&text),
                    Some(StreamEvent::ToolCallStart { id, name }) => {
                        tool_executor.begin_call(&id, &name);
                    }
                    Some(StreamEvent::ToolCallDelta { id, arguments }) => {
                        tool_executor.append_arguments(&id, &arguments);
                    }
                    Some(StreamEvent::ToolCallEnd { id }) => {
                        if let Some(execution) =
                            tool_executor.finish_call(&id, self.route(&request))
                        {
                            executions.push(execution);
                        }
                    }
                    Some(StreamEvent::Done) => break StreamFinishReason::Done,
                    Some(StreamEvent::Error(message)) => {
                        break StreamFinishReason::Error(message);
                    }
                    // Sender dropped without Done or Error: the stream task
                    // was aborted.
                    None => break StreamFinishReason::Cancelled,
                },
                Some(event) = tool_rx.recv() => forward_tool_event(&out, event),
                Some(result) = executions.next(), if !executions.is_empty() => {
                    results.push(result);
                }
            }
        };

        let mut used_fallback = false;
        if finish == StreamFinishReason::Done {
            // Done can arrive while executions are still in flight; their
            // results belong to this completion.
            while let Some(result) = executions.next().await {
                results.push(result);
            }
            drain_tool_events(&out, &mut tool_rx);

            if self.config.fallback_enabled
                && answer.full_text().trim().is_empty()
                && results.iter().any(|r| !r.is_error())
            {
                match self
                    .client
                    .complete(fallback_prompt(&request, &results))
                    .await
                {
                    Ok(text) if !text.trim().is_empty() => {
                        used_fallback = true;
                        answer.add(&text);
                    }
                    Ok(_) => tracing::warn!("fallback completion returned empty text"),
                    // The tool results still stand on their own; losing the
                    // fallback must not fail the whole completion.
                    Err(e) => tracing::warn!("fallback completion failed: {e}"),
                }
            }
        } else {
            // On cancellation or stream error, pending executions never run
            // and never consume quota.
            drop(executions);
            drain_tool_events(&out, &mut tool_rx);
        }

        reasoning.end();
        answer.end();

        let outcome = CompletionOutcome {
            answer: answer.full_text().to_string(),
            reasoning: reasoning.full_text().to_string(),
            tool_results: results,
            finish: finish.clone(),
            used_fallback,
        };
        let _ = out.send(ResponseEvent::Completed {
            answer: outcome.answer.clone(),
            reasoning: outcome.reasoning.clone(),
            finish: outcome.finish.clone(),
            used_fallback,
        });

        match finish {
            StreamFinishReason::Error(message) => {
                Err(classify_stream_error(&request.attachments, message))
            }
            StreamFinishReason::Done | StreamFinishReason::Cancelled => Ok(outcome),
        }
    }

    /// Build the execution route for one call, per the tool's policy hooks.
    ///
    /// Admission-gated tools: tier check, then rate limit, then execution,
    /// and usage is tracked only after the execution succeeds. Cache-eligible
    /// tools go through the deduplication cache under a canonicalized key.
    /// Everything else executes directly.
    fn route(&self, request: &CompletionRequest) -> ExecutionRoute {
        let cache = self.cache.clone();
        let admission = self.admission.clone();
        let user = request.user_id.clone();
        let tier = request.tier;

        Box::new(move |tool, args| {
            if tool.requires_admission() {
                if let Err(e) = admission
                    .require_authorized_tier(tier)
                    .and_then(|()| admission.check_rate_limit(&user))
                {
                    return futures_util::future::ready(Err(ToolError::execution(e.to_string())))
                        .boxed();
                }
                async move {
                    let value = tool.execute(args).await?;
                    admission.track_usage(&user);
                    Ok(value)
                }
                .boxed()
            } else if tool.cache_eligible() {
                let key = cache_key(tool.name(), &args);
                async move { cache.execute(&key, move || tool.execute(args)).await }.boxed()
            } else {
                tool.execute(args)
            }
        })
    }
}

enum Channel {
    Answer,
    Reasoning,
}

fn channel_buffer(
    config: &BufferConfig,
    out: mpsc::UnboundedSender<ResponseEvent>,
    channel: Channel,
) -> ChunkBuffer {
    ChunkBuffer::new(
        config.threshold,
        config.break_markers.clone(),
        move |chunk, full_text| {
            let event = match channel {
                Channel::Answer => ResponseEvent::AnswerDelta {
                    chunk: chunk.to_string(),
                    full_text: full_text.to_string(),
                },
                Channel::Reasoning => ResponseEvent::ReasoningDelta {
                    chunk: chunk.to_string(),
                    full_text: full_text.to_string(),
                },
            };
            forward(&out, event);
        },
    )
}

fn forward(out: &mpsc::UnboundedSender<ResponseEvent>, event: ResponseEvent) {
    if out.send(event).is_err() {
        tracing::debug!("response event receiver dropped");
    }
}

fn forward_tool_event(out: &mpsc::UnboundedSender<ResponseEvent>, event: ToolEvent) {
    forward(out, ResponseEvent::Tool(event));
}

fn drain_tool_events(
    out: &mpsc::UnboundedSender<ResponseEvent>,
    tool_rx: &mut mpsc::UnboundedReceiver<ToolEvent>,
) {
    while let Ok(event) = tool_rx.try_recv() {
        forward_tool_event(out, event);
    }
}

/// Cache key for a tool invocation: tool name plus arguments serialized with
/// recursively sorted object keys, so semantically identical calls collide
/// regardless of key order in the streamed JSON.
fn cache_key(tool: &str, args: &Value) -> String {
    let mut key = String::with_capacity(64);
    key.push_str(tool);
    key.push(':');
    write_canonical(&mut key, args);
    key
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(out, &map[k.as_str()]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Prompt for the fallback pass: the user's question plus every successful
/// tool result, asking for a final answer grounded in those results.
fn fallback_prompt(request: &CompletionRequest, results: &[ToolResult]) -> String {
    let mut prompt = String::new();
    prompt.push_str("The user asked:\n");
    prompt.push_str(&request.prompt);
    prompt.push_str(
        "\n\nTools ran successfully but no answer text was produced. \
         Write the final answer for the user based only on these tool results:\n",
    );
    for result in results.iter().filter(|r| !r.is_error()) {
        if let Some(value) = result.outcome.as_success() {
            prompt.push('\n');
            prompt.push('[');
            prompt.push_str(&result.tool_name);
            prompt.push_str("] ");
            prompt.push_str(&value.to_string());
            prompt.push('\n');
        }
    }
    prompt
}

const DOCUMENT_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

fn is_document(content_type: &str) -> bool {
    DOCUMENT_CONTENT_TYPES.contains(&content_type)
}

/// Map a stream error to the document-processing error when a document
/// attachment plausibly caused it, so the user gets a message naming the
/// format instead of a generic failure.
fn classify_stream_error(attachments: &[Attachment], message: String) -> EngineError {
    let lower = message.to_lowercase();
    let mentions_document =
        lower.contains("document") || lower.contains("attachment") || lower.contains("unsupported");
    if mentions_document
        && let Some(attachment) = attachments.iter().find(|a| is_document(&a.content_type))
    {
        return EngineError::DocumentProcessing {
            content_type: attachment.content_type.clone(),
            message,
        };
    }
    EngineError::Stream(message)
}
