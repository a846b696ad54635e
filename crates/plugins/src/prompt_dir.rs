//! Prompt directories: every template file becomes one prompt function.
//!
//! Two layouts are recognized, and may be mixed in one directory:
//!
//! ```text
//! plugins/Writer/
//! ├── Summarize.txt            flat: function "Summarize"
//! ├── Shorten.prompt           flat: function "Shorten"
//! └── Poem/
//!     ├── skprompt.txt         function "Poem"
//!     └── config.json          optional description, inputs, settings
//! ```
//!
//! Functions are added in file-name order.

use rustedkernel_core::error::{Error, Result};
use rustedkernel_core::function::{InputVariable, KernelFunction, Plugin, PromptFunction};
use rustedkernel_core::settings::ExecutionSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const TEMPLATE_FILE: &str = "skprompt.txt";
pub const CONFIG_FILE: &str = "config.json";
const FLAT_EXTENSIONS: [&str; 2] = ["txt", "prompt"];

/// The optional `config.json` next to a `skprompt.txt`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub input_variables: Vec<PromptConfigInput>,

    #[serde(default)]
    pub execution_settings: Option<PromptConfigSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfigInput {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub default: Option<serde_json::Value>,

    #[serde(default = "default_required")]
    pub is_required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfigSettings {
    #[serde(default)]
    pub default: Option<ExecutionSettings>,
}

impl PromptConfig {
    fn into_prompt_function(self, template: String) -> (String, PromptFunction) {
        let mut prompt = PromptFunction::new(template);
        for input in self.input_variables {
            let mut variable = InputVariable::new(input.name);
            variable.description = input.description;
            variable.required = input.is_required;
            if let Some(default) = input.default {
                variable = variable.with_default(default);
            }
            prompt = prompt.with_input_variable(variable);
        }
        if let Some(settings) = self.execution_settings.and_then(|s| s.default) {
            prompt = prompt.with_execution_settings(settings);
        }
        (self.description, prompt)
    }
}

fn io_error(path: &Path, e: std::io::Error) -> Error {
    Error::Config {
        message: format!("Failed to read prompt path {}: {e}", path.display()),
    }
}

/// Load every prompt function in `dir` into a plugin named `name`.
pub async fn load(name: &str, dir: &Path) -> Result<Plugin> {
    let mut paths: Vec<PathBuf> = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| io_error(dir, e))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
        paths.push(entry.path());
    }
    paths.sort();

    let mut plugin = Plugin::new(name);
    for path in paths {
        let function = if path.is_dir() {
            load_template_dir(&path).await?
        } else {
            load_flat_file(&path).await?
        };
        if let Some(function) = function {
            plugin.add_function(function)?;
        }
    }

    debug!(plugin = name, dir = %dir.display(), functions = plugin.len(), "Loaded prompt directory");
    Ok(plugin)
}

async fn load_flat_file(path: &Path) -> Result<Option<KernelFunction>> {
    let is_template = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| FLAT_EXTENSIONS.contains(&e));
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return Ok(None);
    };
    if !is_template {
        return Ok(None);
    }
    let template = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| io_error(path, e))?;
    Ok(Some(KernelFunction::prompt(stem, "", PromptFunction::new(template))))
}

async fn load_template_dir(dir: &Path) -> Result<Option<KernelFunction>> {
    let template_path = dir.join(TEMPLATE_FILE);
    if !template_path.is_file() {
        return Ok(None);
    }
    let Some(name) = dir.file_name().and_then(|s| s.to_str()) else {
        return Ok(None);
    };
    let template = tokio::fs::read_to_string(&template_path)
        .await
        .map_err(|e| io_error(&template_path, e))?;

    let config_path = dir.join(CONFIG_FILE);
    let config = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => serde_json::from_str::<PromptConfig>(&content).map_err(|e| Error::Config {
            message: format!("Invalid {}: {e}", config_path.display()),
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => PromptConfig::default(),
        Err(e) => {
            warn!(path = %config_path.display(), error = %e, "Prompt config unreadable");
            return Err(io_error(&config_path, e));
        }
    };

    let (description, prompt) = config.into_prompt_function(template);
    Ok(Some(KernelFunction::prompt(name, description, prompt)))
}
