//! `rustedkernel functions`: list registered functions as tool descriptors.

use std::path::PathBuf;

use rustedkernel_config::KernelConfig;

pub async fn run(config: &KernelConfig, plugin_dirs: &[PathBuf]) -> anyhow::Result<()> {
    let kernel = super::build_kernel(config, plugin_dirs).await?;
    let tools = kernel.registry().list_for_model();
    println!("{}", serde_json::to_string_pretty(&tools)?);
    Ok(())
}
