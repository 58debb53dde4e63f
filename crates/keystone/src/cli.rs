//! Command-line interface handling for the Keystone server.
//!
//! Every flag overrides the matching configuration file setting.

use clap::Parser;
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "keystone",
    version,
    about = "Version-adaptive packet interception server"
)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE", default_value = "config.toml")]
    pub config_path: PathBuf,

    /// Bind address (e.g., 127.0.0.1:8080)
    #[arg(short = 'b', long = "bind", value_name = "ADDRESS")]
    pub bind_address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long = "json-logs")]
    pub json_logs: bool,

    /// Build string the server reports, e.g. "git-Paper-196 (MC: 1.20.4)"
    #[arg(long = "build-version", value_name = "BUILD")]
    pub build_version: Option<String>,
}
