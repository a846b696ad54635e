//! Completion backend trait: the abstraction over text/chat/embedding models.
//!
//! A backend knows how to send a chat history to a model and get a reply
//! back, either as a complete message or as a stream of deltas, and how to
//! turn text into embedding vectors. Concrete providers live outside this
//! workspace; the kernel only depends on this contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::message::{ChatMessage, ToolCallRequest};
use crate::settings::ExecutionSettings;

/// Capacity of the delta channel used by the default `stream` implementation.
pub const STREAM_CHANNEL_CAPACITY: usize = 32;

/// A request sent to a completion backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The conversation so far
    pub messages: Vec<ChatMessage>,

    /// Functions the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Model, sampling and function-choice settings
    #[serde(default)]
    pub settings: ExecutionSettings,

    /// Whether the response will be streamed
    #[serde(default)]
    pub stream: bool,
}

/// A function descriptor offered to the model for tool calling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Model-facing name (`Plugin-Function`)
    pub name: String,

    /// Description of what the function does
    pub description: String,

    /// JSON Schema describing the function's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The generated message (content and/or tool calls)
    pub message: ChatMessage,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Sum two usage records.
    pub fn merge(self, other: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(other.total_tokens),
        }
    }
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Completed tool calls (resolvable once the stream ends)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    /// A content-only delta.
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

/// Receiving half of a streamed completion.
pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, BackendError>>;

/// An embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Embedding model; `None` lets the backend choose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// The texts to embed.
    pub inputs: Vec<String>,
}

/// An embedding response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// The embedding vectors, one per input text.
    pub embeddings: Vec<Vec<f32>>,

    /// Which model was used.
    pub model: String,
}

/// The core completion backend trait.
///
/// The kernel calls `complete()` or `stream()` without knowing which model
/// service sits behind it. Retries are the backend's own business.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// A human-readable name for this backend.
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError>;

    /// Send a request and get a bounded channel of response chunks.
    ///
    /// Default implementation calls `complete()` and forwards the result as a
    /// single final chunk.
    async fn stream(&self, request: CompletionRequest) -> Result<ChunkReceiver, BackendError> {
        let response = self.complete(request).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(response.message.content),
                tool_calls: response.message.tool_calls,
                done: true,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }

    /// Generate embeddings for the given texts.
    ///
    /// Default implementation reports that embeddings aren't supported.
    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse, BackendError> {
        Err(BackendError::NotConfigured(format!(
            "Backend '{}' does not support embeddings",
            self.name()
        )))
    }

    /// Whether every tool call in a round must succeed for the round to
    /// continue. Backends that cannot accept partial tool results return `true`.
    fn requires_atomic_tool_results(&self) -> bool {
        false
    }
}

/// Placeholder backend used when a kernel is built without one.
///
/// Rendering and direct function invocation work; every dispatch fails
/// with [`BackendError::NotConfigured`].
pub struct UnconfiguredBackend;

#[async_trait]
impl CompletionBackend for UnconfiguredBackend {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, BackendError> {
        Err(BackendError::NotConfigured(
            "no completion backend was configured for this kernel".into(),
        ))
    }
}
