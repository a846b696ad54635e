//! `rustedkernel render`: render a template offline.

use std::path::PathBuf;

use rustedkernel_config::KernelConfig;
use rustedkernel_core::CancellationToken;

pub async fn run(
    config: &KernelConfig,
    template: &str,
    vars: &[String],
    plugin_dirs: &[PathBuf],
) -> anyhow::Result<()> {
    let kernel = super::build_kernel(config, plugin_dirs).await?;
    let arguments = super::parse_vars(vars)?;
    let rendered = kernel
        .render_prompt(template, &arguments, &CancellationToken::new())
        .await?;
    println!("{rendered}");
    Ok(())
}
