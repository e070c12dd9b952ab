use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "modeld")]
#[command(version)]
#[command(about = "Keeps one local llama.cpp model server running", long_about = None)]
pub(crate) struct Cli {
    /// Print the daemon's raw JSON response data
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run or stop the daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Show what the daemon is serving
    Status,

    /// Load a model, replacing the current one
    Load {
        /// Target: h:owner/repo:QUANT, p:preset-name, or f:/path/to/file
        identifier: String,

        /// Download a missing Hugging Face model first
        #[arg(long)]
        pull: bool,
    },

    /// Stop the running model server
    Unload,

    /// List stored presets
    Presets,

    /// List downloaded models
    Models,

    /// Show recent model server output
    Logs {
        /// Number of recent lines to show
        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,
    },
}

#[derive(Subcommand)]
pub(crate) enum DaemonCommands {
    /// Run the daemon in the foreground
    Run,

    /// Ask a running daemon to stop
    Stop,
}
