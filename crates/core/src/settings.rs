//! Per-invocation execution settings.
//!
//! Settings travel with each `invoke_*` call and into every backend request.
//! Defaults match the `[execution]` section of the configuration file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on dispatch and tool-invocation round trips.
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 8;

/// Whether the model may call registered functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionChoiceBehavior {
    /// No function descriptors are offered; tool-call requests are ignored.
    None,
    /// All registry functions are offered and requested calls run automatically.
    #[default]
    Auto,
}

/// What happens to a round when one of its tool calls fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailurePolicy {
    /// Record the failure as a tool-role error message and keep going.
    #[default]
    Continue,
    /// Fail the round with the function's execution error.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Backend model id; `None` lets the backend choose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub function_choice: FunctionChoiceBehavior,

    /// Per-dispatch timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    #[serde(default)]
    pub tool_failure: ToolFailurePolicy,
}

fn default_max_tool_rounds() -> u32 {
    DEFAULT_MAX_TOOL_ROUNDS
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            max_tokens: None,
            function_choice: FunctionChoiceBehavior::default(),
            timeout_secs: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            tool_failure: ToolFailurePolicy::default(),
        }
    }
}

impl ExecutionSettings {
    pub fn with_function_choice(mut self, choice: FunctionChoiceBehavior) -> Self {
        self.function_choice = choice;
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_tool_failure(mut self, policy: ToolFailurePolicy) -> Self {
        self.tool_failure = policy;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
