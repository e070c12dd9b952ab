//! Command-line arguments and router configuration for the inference server.

use crate::error::{DaemonError, Result};
use crate::preset::{LaunchSpec, Mmproj, Mode, ModelSpec, OptionValue, Options};
use std::fmt::Write as _;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use tempfile::Builder;
use tracing::debug;

/// Arguments for one server launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub args: Vec<String>,
    /// Router configuration written for this launch, if any.
    pub router_config: Option<PathBuf>,
}

/// Builds the launch arguments for `spec`. Router mode writes its model
/// sections to `router_config_path` first.
pub fn plan(spec: &LaunchSpec, router_config_path: &Path) -> Result<LaunchPlan> {
    match spec.mode {
        Mode::Single => Ok(LaunchPlan {
            args: single_args(spec)?,
            router_config: None,
        }),
        Mode::Router => {
            let text = router_config(&spec.models);
            write_atomic(router_config_path, text.as_bytes()).map_err(|source| {
                DaemonError::ConfigWriteFailed {
                    path: router_config_path.to_path_buf(),
                    source,
                }
            })?;
            debug!(path = %router_config_path.display(), models = spec.models.len(), "Wrote router configuration");

            let mut args = vec![
                "--models-preset".to_string(),
                router_config_path.display().to_string(),
            ];
            push_listen(&mut args, spec);
            push_options(&mut args, &spec.options);
            Ok(LaunchPlan {
                args,
                router_config: Some(router_config_path.to_path_buf()),
            })
        }
    }
}

fn single_args(spec: &LaunchSpec) -> Result<Vec<String>> {
    let model = spec.model.as_ref().ok_or_else(|| DaemonError::InvalidPreset {
        name: spec.name.clone(),
        reason: "single mode requires a model".to_string(),
    })?;

    let mut args = vec!["-m".to_string(), model.display().to_string()];
    if let Some(draft) = &spec.draft_model {
        args.push("--model-draft".to_string());
        args.push(draft.display().to_string());
    }
    match &spec.mmproj {
        Some(Mmproj::Path(path)) => {
            args.push("--mmproj".to_string());
            args.push(path.display().to_string());
        }
        Some(Mmproj::Disabled) => args.push("--no-mmproj".to_string()),
        None => {}
    }
    push_listen(&mut args, spec);
    push_options(&mut args, &spec.options);
    Ok(args)
}

fn push_listen(args: &mut Vec<String>, spec: &LaunchSpec) {
    args.push("--host".to_string());
    args.push(spec.host.clone());
    args.push("--port".to_string());
    args.push(spec.port.to_string());
}

fn push_options(args: &mut Vec<String>, options: &Options) {
    for (key, value) in options {
        match value {
            OptionValue::Bool(true) => args.push(format!("--{key}")),
            OptionValue::Bool(false) => {}
            other => {
                args.push(format!("--{key}"));
                args.push(other.to_string());
            }
        }
    }
}

/// INI text with one section per router entry.
pub fn router_config(models: &[ModelSpec]) -> String {
    let mut out = String::new();
    for (i, entry) in models.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "[{}]", entry.name);
        let _ = writeln!(out, "model = {}", entry.model.display());
        if let Some(draft) = &entry.draft_model {
            let _ = writeln!(out, "model-draft = {}", draft.display());
        }
        match &entry.mmproj {
            Some(Mmproj::Path(path)) => {
                let _ = writeln!(out, "mmproj = {}", path.display());
            }
            Some(Mmproj::Disabled) => out.push_str("no-mmproj = true\n"),
            None => {}
        }
        for (key, value) in &entry.options {
            let _ = writeln!(out, "{key} = {value}");
        }
    }
    out
}

/// Writes via a temp file in the target directory, then renames over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let directory = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "target path did not have a parent directory",
        )
    })?;
    std::fs::create_dir_all(directory)?;

    let mut builder = Builder::new();
    builder.prefix(
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("modeld"),
    );
    let mut file = builder.tempfile_in(directory)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}
