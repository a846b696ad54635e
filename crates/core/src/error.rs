//! Error types for the RustedKernel domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; all of them roll up into
//! the top-level [`Error`].

use thiserror::Error;

/// Boxed cause carried by [`FunctionError::Execution`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The top-level error type for all RustedKernel operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Function registry / invocation errors ---
    #[error("Function error: {0}")]
    Function(#[from] FunctionError),

    // --- Prompt rendering errors ---
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    // --- Completion backend errors ---
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    // --- Memory store errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Filter chain ---
    #[error("Filter '{filter}' failed: {reason}")]
    Filter { filter: String, reason: String },

    // --- Automatic function calling ---
    #[error("Tool call loop exceeded {max_rounds} round(s)")]
    ToolCallLoopExceeded { max_rounds: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid chat history: {0}")]
    InvalidHistory(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("Duplicate function name: {0}")]
    DuplicateName(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Invalid plugin or function name '{0}': only ASCII letters, digits and '_' are allowed")]
    InvalidName(String),

    #[error("Invalid argument '{parameter}' for {function}: {reason}")]
    Argument {
        function: String,
        parameter: String,
        reason: String,
    },

    #[error("Function execution failed: {function}: {source}")]
    Execution {
        function: String,
        #[source]
        source: BoxError,
    },
}

impl FunctionError {
    /// Wrap any failure as an execution error of `function`.
    pub fn execution(function: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Execution {
            function: function.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TemplateError {
    #[error("Undefined template variable: {0}")]
    UndefinedVariable(String),

    #[error("Template syntax error at offset {offset}: {reason}")]
    Syntax { offset: usize, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by backend, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend not configured: {0}")]
    NotConfigured(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Vector dimension mismatch in '{collection}': expected {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("Schema mismatch for collection '{collection}': {reason}")]
    SchemaMismatch { collection: String, reason: String },

    #[error("Invalid record '{key}': {reason}")]
    InvalidRecord { key: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),
}
