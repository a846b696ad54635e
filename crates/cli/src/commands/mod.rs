pub mod config_cmd;
pub mod functions;
pub mod render;

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use rustedkernel_config::KernelConfig;
use rustedkernel_core::function::KernelArguments;
use rustedkernel_kernel::Kernel;
use rustedkernel_plugins::{MathPlugin, PluginSource, TimePlugin};

/// Load the config from `path`, or from the default location with env overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<KernelConfig> {
    let config = match path {
        Some(path) => KernelConfig::load_from(path),
        None => KernelConfig::load(),
    };
    config.context("Failed to load config")
}

/// A kernel with the built-in Time and Math plugins plus every prompt
/// directory from the config and the command line. No backend is attached.
pub async fn build_kernel(config: &KernelConfig, extra_dirs: &[PathBuf]) -> anyhow::Result<Kernel> {
    let mut builder = Kernel::builder()
        .with_config(config)
        .with_plugin(PluginSource::native_type::<TimePlugin>("Time").load().await?)
        .with_plugin(PluginSource::native_type::<MathPlugin>("Math").load().await?);

    for dir in config.plugins.prompt_directories.iter().chain(extra_dirs) {
        let name = plugin_name(dir)?;
        let plugin = PluginSource::prompt_directory(name, dir.clone())
            .load()
            .await
            .with_context(|| format!("Failed to load prompt directory {}", dir.display()))?;
        tracing::debug!(plugin = %plugin.name(), functions = plugin.len(), "Loaded prompt plugin");
        builder = builder.with_plugin(plugin);
    }

    Ok(builder.build()?)
}

/// Prompt directories are registered under their final path component.
fn plugin_name(dir: &Path) -> anyhow::Result<String> {
    match dir.file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => bail!("Cannot derive a plugin name from {}", dir.display()),
    }
}

/// Parse repeated `key=value` pairs into template arguments.
pub fn parse_vars(vars: &[String]) -> anyhow::Result<KernelArguments> {
    let mut arguments = KernelArguments::new();
    for var in vars {
        let Some((key, value)) = var.split_once('=') else {
            bail!("Expected KEY=VALUE, got '{var}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Empty variable name in '{var}'");
        }
        arguments.insert(key, value);
    }
    Ok(arguments)
}
