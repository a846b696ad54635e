//! Configuration loading, validation, and management for RustedKernel.
//!
//! Loads configuration from `~/.rustedkernel/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use rustedkernel_core::memory::{DEFAULT_TOP_K, SimilarityMetric};
use rustedkernel_core::settings::{
    DEFAULT_MAX_TOOL_ROUNDS, ExecutionSettings, FunctionChoiceBehavior, ToolFailurePolicy,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.rustedkernel/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Default per-invocation settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Vector store configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Plugin loading configuration
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub function_choice: FunctionChoiceBehavior,

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

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            max_tokens: None,
            function_choice: FunctionChoiceBehavior::default(),
            timeout_secs: None,
            max_tool_rounds: default_max_tool_rounds(),
            tool_failure: ToolFailurePolicy::default(),
        }
    }
}

/// Which vector store implementation to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackendKind {
    #[default]
    InMemory,
    JsonFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub backend: MemoryBackendKind,

    /// Directory for the `json_file` backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub metric: SimilarityMetric,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Vector dimensionality for collections created from config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: MemoryBackendKind::default(),
            path: None,
            metric: SimilarityMetric::default(),
            top_k: default_top_k(),
            dimensions: None,
        }
    }
}

impl MemoryConfig {
    /// Store directory: the configured path or `~/.rustedkernel/memory`.
    pub fn store_dir(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| KernelConfig::config_dir().join("memory"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directories loaded as prompt-template plugins
    #[serde(default)]
    pub prompt_directories: Vec<PathBuf>,
}

impl KernelConfig {
    /// Load configuration from the default location.
    ///
    /// Order of precedence:
    /// 1. Environment variables (`RUSTEDKERNEL_*`)
    /// 2. Config file (`~/.rustedkernel/config.toml`)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        tracing::debug!(path = %path.display(), "Loaded kernel configuration");
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(model) = std::env::var("RUSTEDKERNEL_MODEL") {
            self.execution.model = Some(model);
        }

        if let Ok(rounds) = std::env::var("RUSTEDKERNEL_MAX_TOOL_ROUNDS") {
            self.execution.max_tool_rounds = rounds.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "RUSTEDKERNEL_MAX_TOOL_ROUNDS must be a non-negative integer, got '{rounds}'"
                ))
            })?;
        }

        if let Ok(timeout) = std::env::var("RUSTEDKERNEL_TIMEOUT_SECS") {
            self.execution.timeout_secs = Some(timeout.parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "RUSTEDKERNEL_TIMEOUT_SECS must be a positive integer, got '{timeout}'"
                ))
            })?);
        }

        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".rustedkernel")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(t) = self.execution.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(ConfigError::ValidationError(
                "execution.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.execution.timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "execution.timeout_secs must be > 0".into(),
            ));
        }

        if self.memory.top_k == 0 {
            return Err(ConfigError::ValidationError("memory.top_k must be > 0".into()));
        }

        if self.memory.dimensions == Some(0) {
            return Err(ConfigError::ValidationError(
                "memory.dimensions must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Per-invocation settings derived from the `[execution]` section.
    pub fn execution_settings(&self) -> ExecutionSettings {
        let e = &self.execution;
        ExecutionSettings {
            model: e.model.clone(),
            temperature: e.temperature,
            max_tokens: e.max_tokens,
            function_choice: e.function_choice,
            timeout_secs: e.timeout_secs,
            max_tool_rounds: e.max_tool_rounds,
            tool_failure: e.tool_failure,
        }
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for rustedkernel_core::Error {
    fn from(err: ConfigError) -> Self {
        rustedkernel_core::Error::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = KernelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.max_tool_rounds, DEFAULT_MAX_TOOL_ROUNDS);
        assert_eq!(config.memory.top_k, DEFAULT_TOP_K);
        assert_eq!(config.memory.backend, MemoryBackendKind::InMemory);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = KernelConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = KernelConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.execution.max_tool_rounds, config.execution.max_tool_rounds);
        assert_eq!(parsed.memory.metric, config.memory.metric);
    }

    #[test]
    fn parses_full_surface() {
        let config = KernelConfig::from_toml_str(
            r#"
[execution]
model = "gpt-4o-mini"
function_choice = "none"
timeout_secs = 30
max_tool_rounds = 3
tool_failure = "abort"

[memory]
backend = "json_file"
path = "/var/lib/rustedkernel"
metric = "dot_product"
top_k = 2
dimensions = 1536

[plugins]
prompt_directories = ["prompts/Writer"]
"#,
        )
        .unwrap();

        let settings = config.execution_settings();
        assert_eq!(settings.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(settings.function_choice, FunctionChoiceBehavior::None);
        assert_eq!(settings.timeout_secs, Some(30));
        assert_eq!(settings.max_tool_rounds, 3);
        assert_eq!(settings.tool_failure, ToolFailurePolicy::Abort);

        assert_eq!(config.memory.backend, MemoryBackendKind::JsonFile);
        assert_eq!(config.memory.metric, SimilarityMetric::DotProduct);
        assert_eq!(config.memory.top_k, 2);
        assert_eq!(config.memory.dimensions, Some(1536));
        assert_eq!(config.memory.store_dir(), PathBuf::from("/var/lib/rustedkernel"));
        assert_eq!(config.plugins.prompt_directories.len(), 1);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = KernelConfig::default();
        config.execution.temperature = Some(5.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_top_k_rejected() {
        let err = KernelConfig::from_toml_str("[memory]\ntop_k = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn unknown_enum_value_is_parse_error() {
        let err = KernelConfig::from_toml_str("[execution]\nfunction_choice = \"sometimes\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = KernelConfig::load_from(Path::new("/nonexistent/config.toml"));
        let config = result.unwrap();
        assert_eq!(config.execution.max_tool_rounds, DEFAULT_MAX_TOOL_ROUNDS);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[execution]\nmax_tool_rounds = 2\n").unwrap();
        let config = KernelConfig::load_from(&path).unwrap();
        assert_eq!(config.execution.max_tool_rounds, 2);
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = KernelConfig::default_toml();
        assert!(toml_str.contains("max_tool_rounds"));
        assert!(toml_str.contains("top_k"));
    }

    #[test]
    fn config_error_converts_to_core_error() {
        let err: rustedkernel_core::Error = ConfigError::ValidationError("bad".into()).into();
        assert!(matches!(err, rustedkernel_core::Error::Config { .. }));
    }
}
