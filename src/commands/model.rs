use super::{format_duration, print_json};
use anyhow::Result;
use modeld::daemon::protocol::StatusData;
use modeld::daemon::{DaemonClient, DaemonState};

pub(crate) async fn cmd_status(json: bool) -> Result<()> {
    let client = DaemonClient::new();
    let ping = client.ping().await?;
    let status = client.status().await?;

    if json {
        return print_json(&status);
    }

    println!(
        "Daemon:   running (v{}, uptime: {})",
        ping.version,
        format_duration(ping.uptime_secs)
    );
    print_status(&status);
    Ok(())
}

fn print_status(status: &StatusData) {
    println!("State:    {}", status.state);
    if let Some(preset) = &status.preset {
        println!("Model:    {}", preset);
    }
    if let Some(mode) = status.mode {
        println!("Mode:     {}", mode.as_str());
    }
    if let Some(endpoint) = &status.endpoint {
        println!("Endpoint: {}", endpoint);
    }
    if let Some(models) = &status.models {
        println!();
        println!("{:<32} STATUS", "MODEL");
        for model in models {
            println!("{:<32} {}", model.id, model.status);
        }
    }
}

pub(crate) async fn cmd_load(identifier: &str, pull: bool, json: bool) -> Result<()> {
    let client = DaemonClient::new();

    if !json {
        println!("Loading {}...", identifier);
    }
    let loaded = client.load(identifier, pull).await?;

    if json {
        return print_json(&loaded);
    }
    println!("Model is running at {}", loaded.endpoint);
    Ok(())
}

pub(crate) async fn cmd_unload(json: bool) -> Result<()> {
    let client = DaemonClient::new();
    let before = client.status().await?;
    client.unload().await?;

    if json {
        return print_json(&serde_json::json!({}));
    }
    match (before.state, before.preset) {
        (DaemonState::Idle, _) | (_, None) => println!("Nothing was loaded"),
        (_, Some(preset)) => println!("Unloaded {}", preset),
    }
    Ok(())
}

pub(crate) async fn cmd_logs(lines: usize, json: bool) -> Result<()> {
    let client = DaemonClient::new();
    let output = client.logs(lines).await?;

    if json {
        return print_json(&serde_json::json!({ "lines": output }));
    }
    if output.is_empty() {
        println!("No server output captured yet");
    }
    for line in output {
        println!("{}", line);
    }
    Ok(())
}
