//! Turns identifiers into launch specifications.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::ModelCatalog;
use crate::error::{DaemonError, Result};
use crate::identifier::{Identifier, ModelRef};
use crate::preset::{LaunchSpec, Mmproj, ModelSpec, Preset, PresetEntry};
use crate::preset_store::PresetStore;
use crate::puller::Puller;

/// Listen address used when a preset does not set one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenDefaults {
    pub host: String,
    pub port: u16,
}

impl Default for ListenDefaults {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

pub struct Resolver {
    presets: Arc<dyn PresetStore>,
    catalog: Arc<dyn ModelCatalog>,
    puller: Arc<dyn Puller>,
    defaults: ListenDefaults,
}

/// A resolved model reference; `source` is set for catalog-backed models.
struct ResolvedModel {
    path: PathBuf,
    source: Option<(String, String)>,
}

impl Resolver {
    pub fn new(
        presets: Arc<dyn PresetStore>,
        catalog: Arc<dyn ModelCatalog>,
        puller: Arc<dyn Puller>,
        defaults: ListenDefaults,
    ) -> Self {
        Self {
            presets,
            catalog,
            puller,
            defaults,
        }
    }

    pub fn presets(&self) -> &Arc<dyn PresetStore> {
        &self.presets
    }

    pub fn catalog(&self) -> &Arc<dyn ModelCatalog> {
        &self.catalog
    }

    pub async fn resolve(
        &self,
        cancel: &CancellationToken,
        identifier: &Identifier,
        auto_pull: bool,
    ) -> Result<LaunchSpec> {
        debug!(identifier = %identifier, auto_pull, "Resolving launch target");
        match identifier {
            Identifier::PresetName(name) => {
                let preset = self.presets.load(name).await?;
                self.resolve_preset(cancel, &preset, auto_pull).await
            }
            Identifier::PresetFile(path) => {
                let preset = self.presets.load_file(path).await?;
                self.resolve_preset(cancel, &preset, auto_pull).await
            }
            Identifier::ModelFile(path) => Ok(LaunchSpec::for_model_file(
                file_label(path),
                path.clone(),
                &self.defaults.host,
                self.defaults.port,
            )),
            Identifier::HuggingFace { repo, quant } => {
                let path = self.resolve_hf(cancel, repo, quant, auto_pull).await?;
                let mut spec = LaunchSpec::for_model_file(
                    format!("{repo}:{quant}"),
                    path.clone(),
                    &self.defaults.host,
                    self.defaults.port,
                );
                spec.mmproj = self.companion_mmproj(cancel, repo, quant, &path).await?;
                Ok(spec)
            }
        }
    }

    /// Builds a spec from a stored preset. Reads `preset` only; every field
    /// of the result is a fresh value, and any failing router entry fails
    /// the whole call.
    pub async fn resolve_preset(
        &self,
        cancel: &CancellationToken,
        preset: &Preset,
        auto_pull: bool,
    ) -> Result<LaunchSpec> {
        preset.validate()?;

        let (model, draft_model, mmproj) = match preset.model.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                let entry = PresetEntry {
                    name: preset.name.clone(),
                    model: Some(raw.to_string()),
                    draft_model: preset.draft_model.clone(),
                    mmproj: preset.mmproj.clone(),
                    options: Default::default(),
                };
                let resolved = self.resolve_entry(cancel, &entry, auto_pull).await?;
                (Some(resolved.model), resolved.draft_model, resolved.mmproj)
            }
            _ => (None, None, Mmproj::from_user(preset.mmproj.as_deref())),
        };

        let mut models = Vec::with_capacity(preset.models.len());
        if preset.mode == crate::preset::Mode::Router {
            for entry in &preset.models {
                models.push(self.resolve_entry(cancel, entry, auto_pull).await?);
            }
        }

        Ok(LaunchSpec {
            name: preset.name.clone(),
            mode: preset.mode,
            model,
            draft_model,
            mmproj,
            host: preset
                .host
                .clone()
                .unwrap_or_else(|| self.defaults.host.clone()),
            port: preset.port.unwrap_or(self.defaults.port),
            options: preset.options.clone(),
            models,
        })
    }

    async fn resolve_entry(
        &self,
        cancel: &CancellationToken,
        entry: &PresetEntry,
        auto_pull: bool,
    ) -> Result<ModelSpec> {
        let raw = entry.model.as_deref().unwrap_or_default();
        let model = self.resolve_ref(cancel, raw, auto_pull).await?;

        let draft_model = match entry.draft_model.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                Some(self.resolve_ref(cancel, raw, auto_pull).await?.path)
            }
            _ => None,
        };

        let mmproj = match Mmproj::from_user(entry.mmproj.as_deref()) {
            Some(explicit) => Some(explicit),
            None => match &model.source {
                Some((repo, quant)) => {
                    self.companion_mmproj(cancel, repo, quant, &model.path)
                        .await?
                }
                None => None,
            },
        };

        Ok(ModelSpec {
            name: entry.name.clone(),
            model: model.path,
            draft_model,
            mmproj,
            options: entry.options.clone(),
        })
    }

    async fn resolve_ref(
        &self,
        cancel: &CancellationToken,
        raw: &str,
        auto_pull: bool,
    ) -> Result<ResolvedModel> {
        match ModelRef::parse(raw)? {
            ModelRef::Path(path) => Ok(ResolvedModel { path, source: None }),
            ModelRef::HuggingFace { repo, quant } => {
                let path = self.resolve_hf(cancel, &repo, &quant, auto_pull).await?;
                Ok(ResolvedModel {
                    path,
                    source: Some((repo, quant)),
                })
            }
        }
    }

    async fn resolve_hf(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        quant: &str,
        auto_pull: bool,
    ) -> Result<PathBuf> {
        if let Some(path) = self.catalog.file_path(cancel, repo, quant).await? {
            return Ok(path);
        }
        if auto_pull {
            info!(repo = %repo, quant = %quant, "Model not in catalog, pulling");
            self.puller.pull(cancel, repo, quant).await?;
            if let Some(path) = self.catalog.file_path(cancel, repo, quant).await? {
                return Ok(path);
            }
        }
        Err(DaemonError::ModelNotFound {
            repo: repo.to_string(),
            quant: quant.to_string(),
        })
    }

    /// Projector that ships with a catalog model, placed next to the model file.
    async fn companion_mmproj(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        quant: &str,
        model_path: &Path,
    ) -> Result<Option<Mmproj>> {
        let Some(entry) = self.catalog.details(cancel, repo, quant).await? else {
            return Ok(None);
        };
        Ok(entry.mmproj.map(|file| {
            let dir = model_path.parent().unwrap_or_else(|| Path::new("."));
            Mmproj::Path(dir.join(file))
        }))
    }
}

fn file_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
