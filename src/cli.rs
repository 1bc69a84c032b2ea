//! `replicated list|start|stop`: inspect and steer a replication engine
//! through its task store and destination map.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "replicated", about = "Fan out git ref updates to configured remote destinations", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to the main config file.
    #[arg(long, global = true, default_value = "replication.toml")]
    pub config: std::path::PathBuf,

    /// Path to the per-remote config directory.
    #[arg(long, global = true, default_value = "remotes.d")]
    pub remotes_dir: std::path::PathBuf,

    /// Path to the task store directory.
    #[arg(long, global = true, default_value = "replication-store")]
    pub store: std::path::PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List pending and in-flight replication tasks.
    List {
        /// Only show tasks for destinations whose name matches this glob.
        #[arg(long)]
        remote: Option<String>,
        /// Print one line per task instead of just the summary counts.
        #[arg(long)]
        detail: bool,
        /// Emit machine-readable JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Resume accepting replication work for matching destinations.
    Start {
        /// Dispatch everything currently coalescing immediately.
        #[arg(long)]
        now: bool,
        /// Block until the destination(s) finish draining before returning.
        #[arg(long)]
        wait: bool,
        /// Destination name glob; defaults to every destination.
        pattern: Option<String>,
    },
    /// Stop accepting new replication work for matching destinations.
    Stop {
        /// Block until in-flight pushes finish before returning.
        #[arg(long)]
        wait: bool,
        /// Destination name glob; defaults to every destination.
        pattern: Option<String>,
    },
}

impl Command {
    pub fn pattern(&self) -> &str {
        match self {
            Command::List { remote, .. } => remote.as_deref().unwrap_or("*"),
            Command::Start { pattern, .. } => pattern.as_deref().unwrap_or("*"),
            Command::Stop { pattern, .. } => pattern.as_deref().unwrap_or("*"),
        }
    }
}
