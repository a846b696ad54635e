//! Streaming output of the kernel.
//!
//! `StreamEvent` lifts backend chunks into kernel-level events: content
//! deltas as they arrive, the tool calls a round requested, their results,
//! and a final `Done`. Errors end the stream as an `Err` item.

use futures::Stream;
use rustedkernel_core::backend::Usage;
use rustedkernel_core::error::Result;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

/// Capacity of the channel between the streaming task and the consumer.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted while streaming a chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Partial content from the backend.
    Content { delta: String },

    /// The model asked for a function call.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },

    /// A requested call finished.
    ToolResult {
        id: String,
        name: String,
        content: String,
        success: bool,
    },

    /// The turn is complete. `content` is the final round's full text.
    Done {
        content: String,
        rounds: u32,
        usage: Option<Usage>,
    },
}

impl StreamEvent {
    /// Wire name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
        }
    }
}

/// A lazy, non-restartable sequence of [`StreamEvent`]s.
///
/// Dropping it stops the producing task at its next send.
pub struct ChatStream {
    inner: ReceiverStream<Result<StreamEvent>>,
}

impl ChatStream {
    pub(crate) fn new(receiver: mpsc::Receiver<Result<StreamEvent>>) -> Self {
        Self {
            inner: ReceiverStream::new(receiver),
        }
    }

    pub async fn next_event(&mut self) -> Option<Result<StreamEvent>> {
        self.inner.next().await
    }

    /// Drain the stream and concatenate the final round's content deltas.
    ///
    /// Text streamed before a tool call belongs to that tool round and is
    /// dropped, so the result matches the reply of a non-streaming call.
    pub async fn collect_content(mut self) -> Result<String> {
        let mut content = String::new();
        while let Some(event) = self.next_event().await {
            match event? {
                StreamEvent::Content { delta } => content.push_str(&delta),
                StreamEvent::ToolCall { .. } => content.clear(),
                _ => {}
            }
        }
        Ok(content)
    }
}

impl Stream for ChatStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
