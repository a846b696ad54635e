//! Kernel events: observe the pipeline without coupling to it.
//!
//! The kernel publishes an event at each notable step (prompt rendered,
//! function invoked, backend replied, records upserted). Embedders subscribe
//! for logging, metrics or tracing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All events published by the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KernelEvent {
    /// A template finished rendering (after render filters)
    PromptRendered {
        prompt_chars: usize,
        timestamp: DateTime<Utc>,
    },

    /// A function was invoked inline or on the model's request
    FunctionInvoked {
        function: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The completion backend answered one dispatch
    ResponseGenerated {
        backend: String,
        model: String,
        round: u32,
        tool_calls: usize,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// Records were written to a collection
    MemoryUpserted {
        collection: String,
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// An invocation failed
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus.
///
/// Uses `tokio::sync::broadcast`; events are dropped when nobody listens.
pub struct EventBus {
    sender: broadcast::Sender<Arc<KernelEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: KernelEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<KernelEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
