//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// ProtoLock - protocol edit-lock client for the pump-test hub
#[derive(Debug, Parser)]
#[command(
    name = "pl",
    about = "Watch and manage protocol edit locks on the pump-test hub",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    pub stderr: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Follow lock changes read-only until Ctrl-C
    Watch,

    /// Request the edit lock on a protocol
    Lock {
        /// Protocol id
        protocol_id: String,

        /// How long to wait for the hub to confirm, in milliseconds
        #[arg(short, long, default_value_t = 3_000)]
        wait_ms: u64,
    },

    /// Release the edit lock on a protocol
    Unlock {
        /// Protocol id
        protocol_id: String,

        /// How long to wait for the hub to confirm, in milliseconds
        #[arg(short, long, default_value_t = 3_000)]
        wait_ms: u64,
    },

    /// Show or reset this device's identity
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },

    /// Print the effective configuration as YAML
    Config,
}

/// Identity subcommands
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum IdentityCommand {
    /// Print this device's label, claiming one if needed
    Show,

    /// Forget this device's label so the next use claims a new one
    Reset,
}

/// Log file written by the binary
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("protolock")
        .join("logs")
        .join("protolock.log")
}
