use crate::args::DaemonCommands;
use anyhow::{Context, Result};
use modeld::catalog::FsCatalog;
use modeld::clienv;
use modeld::daemon::server::DaemonConfig;
use modeld::daemon::{
    Daemon, DaemonClient, DaemonParts, DaemonServer, HttpHealthProbe, LogBuffer, ServerLauncher,
};
use modeld::preset_store::FsPresetStore;
use modeld::puller::HfPuller;
use modeld::user_config::Settings;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub(crate) async fn cmd_daemon(command: DaemonCommands) -> Result<()> {
    match command {
        DaemonCommands::Run => cmd_daemon_run().await,
        DaemonCommands::Stop => cmd_daemon_stop().await,
    }
}

async fn cmd_daemon_run() -> Result<()> {
    let settings = Settings::load()?;
    let config = DaemonConfig::default();

    println!("Running daemon in foreground (Ctrl+C to stop)");
    println!("  Socket:  {}", config.socket_path.display());
    println!("  Log:     {}", clienv::daemon_log_path().display());
    println!("  Server:  {}", settings.server_binary.display());
    println!("  Presets: {}", settings.presets_dir.display());
    println!("  Models:  {}", settings.models_dir.display());
    println!();

    info!(
        server = %settings.server_binary.display(),
        presets = %settings.presets_dir.display(),
        models = %settings.models_dir.display(),
        "Loaded settings"
    );

    let log_buffer = Arc::new(LogBuffer::default());
    let puller = HfPuller::new(
        &settings.hf_endpoint,
        &settings.models_dir,
        settings.hf_token.clone(),
    )
    .context("Failed to create download client")?;
    let probe = HttpHealthProbe::new(settings.probe).context("Failed to create health probe")?;

    let daemon = Daemon::new(DaemonParts {
        presets: Arc::new(FsPresetStore::new(&settings.presets_dir)),
        catalog: Arc::new(FsCatalog::new(&settings.models_dir)),
        puller: Arc::new(puller),
        launcher: Arc::new(ServerLauncher::new(
            &settings.server_binary,
            Arc::clone(&log_buffer),
            settings.stop_timeout,
        )),
        probe: Arc::new(probe),
        defaults: settings.listen.clone(),
        router_config_path: settings.router_config_path.clone(),
    });

    let server = DaemonServer::new(config, Arc::new(daemon), log_buffer);
    server.run().await
}

async fn cmd_daemon_stop() -> Result<()> {
    let client = DaemonClient::new();

    if !client.is_running().await {
        println!("Daemon is not running");
        return Ok(());
    }

    println!("Stopping daemon...");
    client.shutdown().await?;

    if client.wait_stopped(Duration::from_secs(15)).await {
        println!("Daemon stopped");
    } else {
        println!("Daemon may still be stopping (check with `modeld status`)");
    }
    Ok(())
}
