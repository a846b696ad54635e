//! Shared test utilities for the kernel crate.

use async_trait::async_trait;
use rustedkernel_core::backend::{
    ChunkReceiver, CompletionBackend, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, StreamChunk, Usage,
};
use rustedkernel_core::error::BackendError;
use rustedkernel_core::message::{ChatMessage, ToolCallRequest};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// A mock backend that returns scripted responses in order.
///
/// `complete` pops from `responses`; `stream` pops a chunk script from
/// `streams`, falling back to the next complete response as one chunk.
/// Every request is recorded. Embeddings are `[len, vowels, 1.0]`.
pub struct SequentialMockBackend {
    responses: Mutex<VecDeque<CompletionResponse>>,
    streams: Mutex<VecDeque<Vec<StreamChunk>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    atomic: bool,
}

impl SequentialMockBackend {
    pub fn new(responses: Vec<CompletionResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            streams: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: None,
            atomic: false,
        }
    }

    pub fn with_streams(self, streams: Vec<Vec<StreamChunk>>) -> Self {
        *self.streams.lock().unwrap() = streams.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_atomic_tool_results(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, request: CompletionRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
    }

    fn next_response(&self) -> Result<CompletionResponse, BackendError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| BackendError::InvalidResponse("no scripted response left".into()))
    }
}

#[async_trait]
impl CompletionBackend for SequentialMockBackend {
    fn name(&self) -> &str {
        "sequential-mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, BackendError> {
        self.record(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_response()
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkReceiver, BackendError> {
        self.record(request);
        let scripted = self.streams.lock().unwrap().pop_front();
        let chunks = match scripted {
            Some(chunks) => chunks,
            None => {
                let response = self.next_response()?;
                vec![StreamChunk {
                    content: Some(response.message.content),
                    tool_calls: response.message.tool_calls,
                    done: true,
                    usage: response.usage,
                }]
            }
        };
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            let _ = tx.send(Ok(chunk)).await;
        }
        Ok(rx)
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, BackendError> {
        let embeddings = request
            .inputs
            .iter()
            .map(|text| {
                let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count();
                vec![text.len() as f32, vowels as f32, 1.0]
            })
            .collect();
        Ok(EmbeddingResponse {
            embeddings,
            model: "mock-embed".into(),
        })
    }

    fn requires_atomic_tool_results(&self) -> bool {
        self.atomic
    }
}

pub fn make_text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        message: ChatMessage::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

/// An assistant response requesting one call per `(id, name, arguments)`.
pub fn make_tool_call_response(calls: &[(&str, &str, &str)]) -> CompletionResponse {
    let calls = calls
        .iter()
        .map(|(id, name, arguments)| ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        })
        .collect();
    CompletionResponse {
        message: ChatMessage::assistant_tool_calls("", calls),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
        }),
        model: "mock-model".into(),
    }
}
