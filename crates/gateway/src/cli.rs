//! Command-line interface for the `nerve` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use nerve_domain::config::Config;
use nerve_domain::error::Result;

#[derive(Parser)]
#[command(name = "nerve", about = "Local-first domestic agent kernel", version)]
pub struct Cli {
    /// Configuration file (TOML). Environment variables override it.
    #[arg(long, global = true, default_value = "nerve.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the kernel (default).
    Serve {
        /// Attach the interactive CLI sense to stdin.
        #[arg(long)]
        cli: bool,
    },
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the configuration and exit non-zero on errors.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

pub fn load_config(path: &std::path::Path) -> Result<Config> {
    Config::load(Some(path))
}

pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("could not render config: {e}"),
    }
}

/// Print all issues; returns false when any is an error.
pub fn validate(config: &Config) -> bool {
    let issues = config.validate();
    for issue in &issues {
        println!("{issue}");
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == nerve_domain::config::ConfigSeverity::Error)
        .count();
    if errors > 0 {
        println!("{errors} error(s)");
        false
    } else {
        println!("configuration ok");
        true
    }
}
