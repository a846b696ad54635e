//! RustedKernel CLI, the main entry point.
//!
//! Commands:
//! - `render`     Render a prompt template offline
//! - `functions`  List registered functions as model tool descriptors
//! - `config`     Show, locate or print the default configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "rustedkernel",
    about = "RustedKernel: function-calling kernel tooling",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of ~/.rustedkernel/config.toml
    #[arg(short, long, global = true, env = "RUSTEDKERNEL_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a prompt template without calling a model
    Render {
        /// Template text, e.g. "Hello {{name}}"
        template: String,

        /// Template variable as key=value (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Extra directory of prompt templates to load as a plugin (repeatable)
        #[arg(long = "plugins-dir", value_name = "DIR")]
        plugin_dirs: Vec<PathBuf>,
    },

    /// Print every registered function as a JSON tool descriptor
    Functions {
        /// Extra directory of prompt templates to load as a plugin (repeatable)
        #[arg(long = "plugins-dir", value_name = "DIR")]
        plugin_dirs: Vec<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Print the built-in default configuration
    Default,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Render {
            template,
            vars,
            plugin_dirs,
        } => commands::render::run(&config, &template, &vars, &plugin_dirs).await?,
        Commands::Functions { plugin_dirs } => commands::functions::run(&config, &plugin_dirs).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(&config)?,
            ConfigAction::Path => commands::config_cmd::path(cli.config.as_deref()),
            ConfigAction::Default => commands::config_cmd::default(),
        },
    }

    Ok(())
}
