//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Run plugins against targets as audits", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Run as worker process (internal use)
    #[arg(long, hide = true)]
    pub worker: bool,

    /// Worker ID (used with --worker)
    #[arg(long, value_name = "ID", hide = true)]
    pub worker_id: Option<String>,

    /// Run as the bridge server child (internal use)
    #[arg(long, hide = true)]
    pub bridge_server: bool,

    /// Bridge configuration as JSON (used with --bridge-server)
    #[arg(long, value_name = "JSON", hide = true)]
    pub bridge_config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Warden service
    Serve,

    /// Issue one call against a running service's RPC endpoint
    Call {
        /// Command path, e.g. audit/list
        command: String,

        /// Arguments as JSON values; anything that does not parse is sent as a string
        args: Vec<String>,

        /// Endpoint URL (defaults to the configured bridge address)
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        config_file: PathBuf,
    },

    /// Generate a sample configuration file
    Generate {
        /// Output file path (prints to stdout when omitted)
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration as JSON
    Show,
}
