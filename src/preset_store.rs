use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::{DaemonError, Result};
use crate::preset::Preset;

/// Source of presets by name or by file path.
#[async_trait]
pub trait PresetStore: Send + Sync {
    /// Loads a named preset; a missing preset is `PresetNotFound`.
    async fn load(&self, name: &str) -> Result<Preset>;

    /// Loads and parses a preset file given by path.
    async fn load_file(&self, path: &Path) -> Result<Preset>;

    /// Names of all stored presets, sorted.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Presets stored as `<dir>/<name>.toml`.
#[derive(Debug, Clone)]
pub struct FsPresetStore {
    dir: PathBuf,
}

impl FsPresetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read(&self, path: &Path, missing: impl FnOnce() -> String) -> Result<Preset> {
        trace!(path = %path.display(), "Reading preset");
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DaemonError::PresetNotFound(missing()));
            }
            Err(e) => return Err(e.into()),
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Preset::from_toml(&text, &stem)
    }
}

#[async_trait]
impl PresetStore for FsPresetStore {
    async fn load(&self, name: &str) -> Result<Preset> {
        if name.contains(|c: char| c == '/' || c == '\\') || name.starts_with('.') {
            return Err(DaemonError::PresetNotFound(name.to_string()));
        }
        let path = self.dir.join(format!("{name}.toml"));
        self.read(&path, || name.to_string()).await
    }

    async fn load_file(&self, path: &Path) -> Result<Preset> {
        self.read(path, || path.display().to_string()).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "Presets directory does not exist");
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
