//! # RustedKernel Core
//!
//! Domain types, traits, and error definitions for the RustedKernel
//! function-calling kernel. This crate defines the model every other crate
//! implements against: functions and plugins, the function registry, chat
//! messages, the completion backend contract and the vector store contract.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here. Implementations live in
//! their respective crates (or outside the workspace). This enables:
//! - Swapping backends and stores without touching the kernel
//! - Easy testing with scripted mock implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod backend;
pub mod error;
pub mod event;
pub mod function;
pub mod memory;
pub mod message;
pub mod registry;
pub mod settings;

// Re-export key types at crate root for ergonomics
pub use backend::{
    CompletionBackend, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, StreamChunk, ToolDefinition, UnconfiguredBackend, Usage,
};
pub use error::{BackendError, Error, FunctionError, MemoryError, Result, TemplateError};
pub use event::{EventBus, KernelEvent};
pub use function::{
    FunctionMetadata, FunctionResult, InputVariable, KernelArguments, KernelFunction,
    NativeFunction, ParameterSpec, ParameterType, Plugin, PromptFunction,
};
pub use memory::{
    CollectionSchema, FieldType, MemoryRecord, SearchFilter, SearchHit, SimilarityMetric,
    VectorQuery, VectorStore,
};
pub use message::{ChatHistory, ChatMessage, ChatRole, ToolCallRequest};
pub use registry::{FunctionInvoker, FunctionRegistry};
pub use settings::{ExecutionSettings, FunctionChoiceBehavior, ToolFailurePolicy};

pub use tokio_util::sync::CancellationToken;
