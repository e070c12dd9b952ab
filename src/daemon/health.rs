//! Readiness probing of the launched inference server.

use crate::error::{DaemonError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Per-model status reported by a router-mode server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterModel {
    pub id: String,
    pub status: String,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Resolves once `endpoint` reports ready. Fails with
    /// `HealthCheckTimeout` or `HealthCheckCancelled`.
    async fn wait_ready(&self, cancel: &CancellationToken, endpoint: &str) -> Result<()>;

    /// Live model list of a router-mode server; `None` if unreachable.
    async fn router_models(&self, endpoint: &str) -> Option<Vec<RouterModel>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    /// Overall bound on waiting for readiness.
    pub timeout: Duration,
    /// Bound on each individual request.
    pub probe_timeout: Duration,
    pub interval: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(2),
            interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelStatus>,
}

#[derive(Debug, Deserialize)]
struct ModelStatus {
    id: String,
    status: Option<StatusValue>,
}

#[derive(Debug, Deserialize)]
struct StatusValue {
    value: String,
}

/// Polls `GET {endpoint}/health` until it answers 200.
pub struct HttpHealthProbe {
    client: Client,
    settings: ProbeSettings,
}

impl HttpHealthProbe {
    pub fn new(settings: ProbeSettings) -> Result<Self> {
        let client = Client::builder().timeout(settings.probe_timeout).build()?;
        Ok(Self { client, settings })
    }

    async fn probe_once(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => true,
            Ok(resp) => {
                trace!(status = %resp.status(), "Server not ready yet");
                false
            }
            Err(e) => {
                trace!("Health probe failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn wait_ready(&self, cancel: &CancellationToken, endpoint: &str) -> Result<()> {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let deadline = Instant::now() + self.settings.timeout;
        debug!(url = %url, timeout = ?self.settings.timeout, "Waiting for server readiness");

        loop {
            let ready = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DaemonError::HealthCheckCancelled),
                ready = self.probe_once(&url) => ready,
            };
            if ready {
                info!(endpoint = %endpoint, "Server is ready");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DaemonError::HealthCheckTimeout(self.settings.timeout));
            }
            let pause = self.settings.interval.min(deadline - now);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DaemonError::HealthCheckCancelled),
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn router_models(&self, endpoint: &str) -> Option<Vec<RouterModel>> {
        let url = format!("{}/models", endpoint.trim_end_matches('/'));
        let resp = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(status = %resp.status(), "Router model list unavailable");
                return None;
            }
            Err(e) => {
                debug!("Router model list unavailable: {}", e);
                return None;
            }
        };
        let body: ModelsResponse = resp.json().await.ok()?;
        Some(
            body.data
                .into_iter()
                .map(|m| RouterModel {
                    id: m.id,
                    status: m
                        .status
                        .map(|s| s.value)
                        .unwrap_or_else(|| "unknown".to_string()),
                })
                .collect(),
        )
    }
}
