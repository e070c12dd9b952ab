use super::{format_size, print_json};
use anyhow::Result;
use modeld::daemon::protocol::PresetsData;
use modeld::daemon::DaemonClient;

pub(crate) async fn cmd_presets(json: bool) -> Result<()> {
    let presets = DaemonClient::new().list_presets().await?;

    if json {
        return print_json(&PresetsData { presets });
    }
    if presets.is_empty() {
        println!("No presets found");
        return Ok(());
    }
    for name in presets {
        println!("p:{}", name);
    }
    Ok(())
}

pub(crate) async fn cmd_models(json: bool) -> Result<()> {
    let data = DaemonClient::new().list_models().await?;

    if json {
        return print_json(&data);
    }
    if data.models.is_empty() {
        println!("No downloaded models");
        return Ok(());
    }

    println!("{:<56} {:>10}  MMPROJ", "IDENTIFIER", "SIZE");
    for entry in &data.models {
        println!(
            "{:<56} {:>10}  {}",
            format!("h:{}:{}", entry.repo, entry.quant),
            format_size(entry.size_bytes),
            entry.mmproj.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
