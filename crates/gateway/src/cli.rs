//! Command-line interface and config loading.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use rl_domain::config::Config;

#[derive(Debug, Parser)]
#[command(name = "runloom", version, about = "Durable run engine for an AI assistant")]
pub struct Cli {
    /// Path to the config file (default: ./runloom.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the engine and HTTP surface (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the effective configuration and exit.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

/// Load the TOML config (when present) and apply environment overrides.
pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let default_path = PathBuf::from("runloom.toml");
    let path = path
        .cloned()
        .or_else(|| default_path.exists().then_some(default_path));

    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
            toml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?
        }
        None => Config::default(),
    };

    let vars: std::collections::HashMap<String, String> = std::env::vars().collect();
    config.apply_env_overrides(&vars);
    Ok(config)
}
