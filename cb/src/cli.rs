//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Crewbus - message bus and shared context for a crew of test agents
#[derive(Parser)]
#[command(
    name = "cb",
    about = "Message bus and shared context for a crew of test agents",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run a scripted session with echo workers and print the log and context
    Demo {
        /// Make this participant's worker fail its task
        #[arg(long, value_name = "PARTICIPANT")]
        fail: Option<String>,
    },

    /// Print the effective configuration as YAML
    Config,
}
