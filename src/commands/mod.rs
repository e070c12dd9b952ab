pub(crate) mod catalog;
pub(crate) mod daemon;
pub(crate) mod model;

use anyhow::Result;
use modeld::daemon::client::ClientError;
use serde::Serialize;

/// Exit status for a failed command: 2 for a bad identifier, 1 otherwise.
pub(crate) fn exit_status(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ClientError>().and_then(ClientError::code) {
        Some("invalid_identifier") => 2,
        _ => 1,
    }
}

pub(crate) fn print_json(data: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

pub(crate) fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

pub(crate) fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
