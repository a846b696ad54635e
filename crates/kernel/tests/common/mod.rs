//! Shared fixtures for the kernel integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rustedkernel_core::backend::{
    ChunkReceiver, CompletionBackend, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, StreamChunk, Usage,
};
use rustedkernel_core::error::BackendError;
use rustedkernel_core::message::{ChatMessage, ToolCallRequest};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

type ChunkSender = mpsc::Sender<Result<StreamChunk, BackendError>>;

// ── Scripted backend ─────────────────────────────────────────────────────

/// Returns scripted responses in sequence and records every request.
///
/// Streams split each response's content into the scripted deltas when
/// given, otherwise into one chunk. With `hold_open`, streams never finish.
pub struct ScriptedBackend {
    responses: Mutex<Vec<CompletionResponse>>,
    deltas: Vec<String>,
    hold_open: bool,
    held: Mutex<Vec<ChunkSender>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            deltas: Vec::new(),
            hold_open: false,
            held: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn text(response: &str) -> Self {
        Self::new(vec![text_response(response)])
    }

    pub fn with_deltas(mut self, deltas: &[&str]) -> Self {
        self.deltas = deltas.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn holding_streams_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError> {
        let count = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let responses = self.responses.lock().unwrap();
        responses.get(count).cloned().ok_or_else(|| {
            BackendError::InvalidResponse(format!(
                "ScriptedBackend exhausted: call #{count}, have {}",
                responses.len()
            ))
        })
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError> {
        self.next(request)
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkReceiver, BackendError> {
        let response = self.next(request)?;
        let mut chunks: Vec<StreamChunk> = if self.deltas.is_empty() || response.message.has_tool_calls() {
            vec![StreamChunk::delta(response.message.content)]
        } else {
            self.deltas.iter().map(StreamChunk::delta).collect()
        };
        if !self.hold_open {
            chunks.push(StreamChunk {
                content: None,
                tool_calls: response.message.tool_calls,
                done: true,
                usage: response.usage,
            });
        }

        let (tx, rx) = mpsc::channel(chunks.len() + 1);
        for chunk in chunks {
            let _ = tx.send(Ok(chunk)).await;
        }
        if self.hold_open {
            self.held.lock().unwrap().push(tx);
        }
        Ok(rx)
    }

    /// Embeds text as counts of `a`, `e`, `i`, `o`, `u` plus a bias of 1.
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, BackendError> {
        let embeddings = request
            .inputs
            .iter()
            .map(|text| {
                let mut vector: Vec<f32> = "aeiou"
                    .chars()
                    .map(|v| text.chars().filter(|c| *c == v).count() as f32)
                    .collect();
                vector.push(1.0);
                vector
            })
            .collect();
        Ok(EmbeddingResponse {
            embeddings,
            model: "vowels".into(),
        })
    }
}

// ── Response builders ────────────────────────────────────────────────────

pub fn text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        message: ChatMessage::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock".into(),
    }
}

pub fn tool_response(name: &str, args: serde_json::Value) -> CompletionResponse {
    CompletionResponse {
        message: ChatMessage::assistant_tool_calls("", vec![make_tool_call(name, args)]),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock".into(),
    }
}

pub fn make_tool_call(name: &str, args: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}
