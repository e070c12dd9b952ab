mod args;
mod commands;

use args::{Cli, Commands, DaemonCommands};
use clap::Parser;
use modeld::{clienv, logging};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let logging = match cli.command {
        Commands::Daemon {
            command: DaemonCommands::Run,
        } => logging::init("info", Some(&clienv::daemon_log_path())),
        _ => logging::init("warn", None),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {e:#}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(commands::exit_status(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Daemon { command } => commands::daemon::cmd_daemon(command).await?,
        Commands::Status => commands::model::cmd_status(json).await?,
        Commands::Load { identifier, pull } => {
            commands::model::cmd_load(&identifier, pull, json).await?
        }
        Commands::Unload => commands::model::cmd_unload(json).await?,
        Commands::Presets => commands::catalog::cmd_presets(json).await?,
        Commands::Models => commands::catalog::cmd_models(json).await?,
        Commands::Logs { lines } => commands::model::cmd_logs(lines, json).await?,
    }

    Ok(())
}
