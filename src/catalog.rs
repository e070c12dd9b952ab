//! Catalog of downloaded GGUF model files.
//!
//! Files live under `<models_dir>/<owner>/<repo>/`. Each quantized model file
//! is one entry; `mmproj*.gguf` files in the same directory are recorded as
//! the projector companion of every entry in that directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{DaemonError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub repo: String,
    pub quant: String,
    pub file: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// File name of the companion projector, relative to the model's directory.
    pub mmproj: Option<String>,
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<CatalogEntry>>;

    async fn file_path(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        quant: &str,
    ) -> Result<Option<PathBuf>>;

    async fn details(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        quant: &str,
    ) -> Result<Option<CatalogEntry>>;
}

/// Catalog backed by the models directory.
#[derive(Debug, Clone)]
pub struct FsCatalog {
    root: PathBuf,
}

impl FsCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a repository's files are stored in.
    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        repo.split('/').fold(self.root.clone(), |dir, part| dir.join(part))
    }

    async fn scan_repo(&self, repo: &str, dir: &Path) -> Result<Vec<CatalogEntry>> {
        let mut models = Vec::new();
        let mut projectors = Vec::new();

        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(file) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !file.to_ascii_lowercase().ends_with(".gguf") {
                continue;
            }
            if is_projector(&file) {
                projectors.push(file);
                continue;
            }
            if shard_index(&file).is_some_and(|index| index != 1) {
                continue;
            }
            let size_bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            models.push((file, path, size_bytes));
        }

        projectors.sort();
        let mmproj = projectors.into_iter().next();

        let mut result: Vec<CatalogEntry> = models
            .into_iter()
            .map(|(file, path, size_bytes)| CatalogEntry {
                repo: repo.to_string(),
                quant: quant_of(&file),
                file,
                path,
                size_bytes,
                mmproj: mmproj.clone(),
            })
            .collect();
        result.sort_by(|a, b| a.file.cmp(&b.file));
        Ok(result)
    }

    async fn find(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        quant: &str,
    ) -> Result<Option<CatalogEntry>> {
        if cancel.is_cancelled() {
            return Err(DaemonError::Cancelled);
        }
        let dir = self.repo_dir(repo);
        if !dir.is_dir() {
            trace!(repo = %repo, "Repository not present in catalog");
            return Ok(None);
        }
        let entries = self.scan_repo(repo, &dir).await?;
        Ok(entries
            .into_iter()
            .find(|e| e.quant.eq_ignore_ascii_case(quant)))
    }
}

#[async_trait]
impl ModelCatalog for FsCatalog {
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<CatalogEntry>> {
        if !self.root.is_dir() {
            debug!(dir = %self.root.display(), "Models directory does not exist");
            return Ok(Vec::new());
        }

        let mut all = Vec::new();
        let mut owners = tokio::fs::read_dir(&self.root).await?;
        while let Some(owner) = owners.next_entry().await? {
            if !owner.file_type().await?.is_dir() {
                continue;
            }
            let owner_name = owner.file_name().to_string_lossy().into_owned();
            let mut repos = tokio::fs::read_dir(owner.path()).await?;
            while let Some(repo) = repos.next_entry().await? {
                if cancel.is_cancelled() {
                    return Err(DaemonError::Cancelled);
                }
                if !repo.file_type().await?.is_dir() {
                    continue;
                }
                let repo_id = format!("{}/{}", owner_name, repo.file_name().to_string_lossy());
                all.extend(self.scan_repo(&repo_id, &repo.path()).await?);
            }
        }

        all.sort_by(|a, b| (&a.repo, &a.file).cmp(&(&b.repo, &b.file)));
        Ok(all)
    }

    async fn file_path(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        quant: &str,
    ) -> Result<Option<PathBuf>> {
        Ok(self.find(cancel, repo, quant).await?.map(|e| e.path))
    }

    async fn details(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        quant: &str,
    ) -> Result<Option<CatalogEntry>> {
        self.find(cancel, repo, quant).await
    }
}

/// Quantization names llama.cpp publishes. Matched longest first so that
/// `Q4_K_M` wins over `Q4_K` and `BF16` over `F16`.
const QUANTIZATIONS: &[&str] = &[
    "IQ2_XXS", "IQ3_XXS", "Q3_K_XL", "Q4_K_XL", "Q5_K_XL", "Q6_K_XL", "Q8_K_XL", "IQ1_S",
    "IQ1_M", "IQ2_XS", "IQ2_S", "IQ2_M", "IQ3_XS", "IQ3_S", "IQ3_M", "IQ4_NL", "IQ4_XS",
    "Q2_K_S", "Q2_K_L", "Q3_K_S", "Q3_K_M", "Q3_K_L", "Q4_K_S", "Q4_K_M", "Q4_K_L", "Q5_K_S",
    "Q5_K_M", "Q5_K_L", "Q6_K_L", "MXFP4", "Q2_K", "Q3_K", "Q4_K", "Q5_K", "Q6_K", "Q4_0",
    "Q4_1", "Q5_0", "Q5_1", "Q8_0", "BF16", "F16", "F32",
];

/// Extracts the quantization label from a GGUF file name.
pub fn extract_quant(filename: &str) -> Option<&'static str> {
    let upper = filename.to_uppercase();
    let mut candidates: Vec<&'static str> = QUANTIZATIONS.to_vec();
    candidates.sort_by_key(|q| std::cmp::Reverse(q.len()));
    candidates.into_iter().find(|q| upper.contains(*q))
}

fn quant_of(filename: &str) -> String {
    if let Some(q) = extract_quant(filename) {
        return q.to_string();
    }
    // Unknown scheme: last dash/dot separated token of the stem.
    let stem = strip_gguf(filename);
    stem.rsplit(|c: char| c == '-' || c == '.')
        .next()
        .unwrap_or(stem)
        .to_uppercase()
}

pub(crate) fn is_projector(filename: &str) -> bool {
    filename.to_ascii_lowercase().starts_with("mmproj")
}

/// 1-based shard number of a split GGUF (`name-00002-of-00003.gguf`).
pub(crate) fn shard_index(filename: &str) -> Option<u32> {
    let stem = strip_gguf(filename);
    let (head, total) = stem.rsplit_once("-of-")?;
    if total.is_empty() || !total.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (_, index) = head.rsplit_once('-')?;
    index.parse().ok()
}

fn strip_gguf(filename: &str) -> &str {
    let len = filename.len();
    if len >= 5 && filename.is_char_boundary(len - 5) && filename[len - 5..].eq_ignore_ascii_case(".gguf")
    {
        &filename[..len - 5]
    } else {
        filename
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str, bytes: usize) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn quant_extraction_prefers_longest_match() {
        assert_eq!(extract_quant("Mistral-7B-Q4_K_M.gguf"), Some("Q4_K_M"));
        assert_eq!(extract_quant("gemma-bf16.gguf"), Some("BF16"));
        assert_eq!(extract_quant("tiny-iq2_xxs.gguf"), Some("IQ2_XXS"));
        assert_eq!(extract_quant("model.gguf"), None);
    }

    #[test]
    fn shard_detection() {
        assert_eq!(shard_index("big-Q8_0-00001-of-00003.gguf"), Some(1));
        assert_eq!(shard_index("big-Q8_0-00002-of-00003.gguf"), Some(2));
        assert_eq!(shard_index("small-Q8_0.gguf"), None);
    }

    #[tokio::test]
    async fn lists_entries_with_projector_companion() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "org/Vision-GGUF/vision-Q4_K_M.gguf", 16);
        touch(dir.path(), "org/Vision-GGUF/vision-Q8_0.gguf", 32);
        touch(dir.path(), "org/Vision-GGUF/mmproj-vision-f16.gguf", 8);
        touch(dir.path(), "org/Vision-GGUF/README.md", 1);

        let catalog = FsCatalog::new(dir.path());
        let entries = catalog.list(&CancellationToken::new()).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].quant, "Q4_K_M");
        assert_eq!(entries[0].size_bytes, 16);
        assert_eq!(entries[0].mmproj.as_deref(), Some("mmproj-vision-f16.gguf"));
        assert_eq!(entries[1].quant, "Q8_0");
    }

    #[tokio::test]
    async fn split_models_list_first_shard_only() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "org/Big-GGUF/big-Q8_0-00001-of-00002.gguf", 4);
        touch(dir.path(), "org/Big-GGUF/big-Q8_0-00002-of-00002.gguf", 4);

        let catalog = FsCatalog::new(dir.path());
        let entries = catalog.list(&CancellationToken::new()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].file.contains("00001-of"));
    }

    #[tokio::test]
    async fn file_path_matches_quant_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "org/Mistral-7B-GGUF/mistral-7b.Q4_K_M.gguf", 4);

        let catalog = FsCatalog::new(dir.path());
        let cancel = CancellationToken::new();
        let path = catalog
            .file_path(&cancel, "org/Mistral-7B-GGUF", "q4_k_m")
            .await
            .unwrap();
        assert_eq!(
            path,
            Some(dir.path().join("org/Mistral-7B-GGUF/mistral-7b.Q4_K_M.gguf"))
        );
        assert!(catalog
            .file_path(&cancel, "org/Mistral-7B-GGUF", "Q8_0")
            .await
            .unwrap()
            .is_none());
        assert!(catalog
            .file_path(&cancel, "org/Missing-GGUF", "Q8_0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn missing_root_lists_empty() {
        let catalog = FsCatalog::new("/nonexistent/modeld/models");
        assert!(catalog.list(&CancellationToken::new()).await.unwrap().is_empty());
    }
}
