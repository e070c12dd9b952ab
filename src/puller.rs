//! Downloads missing models from the Hugging Face hub into the catalog layout.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::{extract_quant, is_projector, shard_index};
use crate::error::{DaemonError, Result};

/// Suffix of in-flight download files; never listed by the catalog.
pub const PARTIAL_SUFFIX: &str = ".part";

#[async_trait]
pub trait Puller: Send + Sync {
    /// Fetches `repo` at `quant` so a following catalog lookup can find it.
    async fn pull(&self, cancel: &CancellationToken, repo: &str, quant: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
}

pub struct HfPuller {
    client: Client,
    endpoint: String,
    models_dir: PathBuf,
    token: Option<String>,
}

impl HfPuller {
    pub fn new(
        endpoint: impl Into<String>,
        models_dir: impl Into<PathBuf>,
        token: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("modeld/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            models_dir: models_dir.into(),
            token,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn repo_files(&self, repo: &str) -> Result<Vec<String>> {
        let url = format!("{}/api/models/{}", self.endpoint, repo);
        debug!(url = %url, "Fetching repository file list");
        let resp = self.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(DaemonError::Download(format!(
                "repository {} lookup failed with HTTP {}",
                repo,
                resp.status()
            )));
        }
        let info: RepoInfo = resp.json().await?;
        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        remote: &str,
        dest_dir: &Path,
    ) -> Result<()> {
        let file_name = remote.rsplit('/').next().unwrap_or(remote);
        let dest = dest_dir.join(file_name);
        if dest.exists() {
            debug!(path = %dest.display(), "Already downloaded");
            return Ok(());
        }

        let url = format!("{}/{}/resolve/main/{}", self.endpoint, repo, remote);
        info!(repo = %repo, file = %remote, "Downloading");
        let resp = self.get(&url).send().await?;
        if !resp.status().is_success() {
            let hint = if resp.status().as_u16() == 401 {
                " (set HF_TOKEN for gated repositories)"
            } else {
                ""
            };
            return Err(DaemonError::Download(format!(
                "{} returned HTTP {}{}",
                remote,
                resp.status(),
                hint
            )));
        }

        // The partial file removes itself when dropped, including when this
        // future is dropped mid-transfer.
        let prefix = format!("{file_name}.");
        let (file, partial) = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(dest_dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut stream = resp.bytes_stream();
        let outcome: Result<()> = loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => break Err(DaemonError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    if let Err(e) = file.write_all(&bytes).await {
                        break Err(e.into());
                    }
                }
                Some(Err(e)) => break Err(e.into()),
                None => break file.flush().await.map_err(Into::into),
            }
        };
        drop(file);

        if let Err(e) = outcome {
            debug!(path = %partial.display(), "Discarding partial download");
            return Err(e);
        }

        partial
            .persist(&dest)
            .map_err(|e| DaemonError::Io(e.error))?;
        info!(path = %dest.display(), "Download complete");
        Ok(())
    }
}

#[async_trait]
impl Puller for HfPuller {
    async fn pull(&self, cancel: &CancellationToken, repo: &str, quant: &str) -> Result<()> {
        let files = self.repo_files(repo).await?;
        let selected = select_files(&files, quant);
        if selected.is_empty() {
            return Err(DaemonError::ModelNotFound {
                repo: repo.to_string(),
                quant: quant.to_string(),
            });
        }

        let dest_dir = repo
            .split('/')
            .fold(self.models_dir.clone(), |dir, part| dir.join(part));
        tokio::fs::create_dir_all(&dest_dir).await?;

        for remote in selected {
            self.download(cancel, repo, &remote, &dest_dir).await?;
        }
        Ok(())
    }
}

/// GGUF files of the requested quant (every shard of a split model) plus the
/// first projector companion, if the repository ships one.
fn select_files(files: &[String], quant: &str) -> Vec<String> {
    let mut models: Vec<String> = files
        .iter()
        .filter(|f| f.to_ascii_lowercase().ends_with(".gguf"))
        .filter(|f| !is_projector(base_name(f)))
        .filter(|f| extract_quant(base_name(f)).is_some_and(|q| q.eq_ignore_ascii_case(quant)))
        .cloned()
        .collect();
    models.sort_by_key(|f| shard_index(base_name(f)).unwrap_or(0));

    // A repo may hold the same quant twice (e.g. split and unsplit); keep the
    // variant of the first match.
    if let Some(first) = models.first().cloned() {
        if shard_index(base_name(&first)).is_none() {
            models.truncate(1);
        } else {
            models.retain(|f| shard_index(base_name(f)).is_some());
        }
    }

    let mut projectors: Vec<&String> = files
        .iter()
        .filter(|f| f.to_ascii_lowercase().ends_with(".gguf") && is_projector(base_name(f)))
        .collect();
    projectors.sort();
    if let Some(projector) = projectors.first() {
        if !models.is_empty() {
            models.push((*projector).clone());
        }
    }
    models
}

fn base_name(remote: &str) -> &str {
    remote.rsplit('/').next().unwrap_or(remote)
}
