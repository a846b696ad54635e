//! `rustedkernel config`: configuration management commands.

use std::path::Path;

use rustedkernel_config::KernelConfig;

pub fn show(config: &KernelConfig) -> anyhow::Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

pub fn path(explicit: Option<&Path>) {
    match explicit {
        Some(path) => println!("{}", path.display()),
        None => println!("{}", KernelConfig::config_dir().join("config.toml").display()),
    }
}

pub fn default() {
    println!("{}", KernelConfig::default_toml());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_valid() {
        let path = KernelConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().contains(".rustedkernel"));
    }

    #[test]
    fn default_toml_round_trips_through_the_loader() {
        let parsed = KernelConfig::from_toml_str(&KernelConfig::default_toml()).unwrap();
        assert_eq!(parsed.execution.max_tool_rounds, 8);
    }
}
