//! The daemon's single-model state machine.
//!
//! State is `Idle -> Loading -> Running`, with exactly one server process and
//! one [`LaunchSpec`] alive at a time. Readers see a [`Snapshot`] published on
//! a `watch` channel and never touch the mutation lock. Mutations (`run`,
//! `kill`) take the lock; each `run` first cancels whichever run is still
//! pending so a load parked on its health check gives way immediately.

use super::health::{HealthProbe, RouterModel};
use super::launch;
use super::supervisor::{self, ExitEvent, Launcher, ProcessHandle};
use crate::catalog::{CatalogEntry, ModelCatalog};
use crate::error::{DaemonError, Result};
use crate::identifier::Identifier;
use crate::preset::{LaunchSpec, Mode};
use crate::preset_store::PresetStore;
use crate::puller::Puller;
use crate::resolver::{ListenDefaults, Resolver};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Idle,
    Loading,
    Running,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Idle => "idle",
            DaemonState::Loading => "loading",
            DaemonState::Running => "running",
        }
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What readers observe: the state and the spec it applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: DaemonState,
    pub spec: Option<Arc<LaunchSpec>>,
}

impl Snapshot {
    fn idle() -> Self {
        Self {
            state: DaemonState::Idle,
            spec: None,
        }
    }
}

/// Collaborators and settings a [`Daemon`] is built from.
pub struct DaemonParts {
    pub presets: Arc<dyn PresetStore>,
    pub catalog: Arc<dyn ModelCatalog>,
    pub puller: Arc<dyn Puller>,
    pub launcher: Arc<dyn Launcher>,
    pub probe: Arc<dyn HealthProbe>,
    pub defaults: ListenDefaults,
    pub router_config_path: PathBuf,
}

/// State owned by whoever holds the mutation lock.
#[derive(Default)]
struct Slot {
    process: Option<Box<dyn ProcessHandle>>,
    router_config: Option<PathBuf>,
    /// Bumped for every started process.
    session: u64,
}

#[derive(Default)]
struct Pending {
    generation: u64,
    token: Option<CancellationToken>,
}

pub struct Daemon {
    resolver: Resolver,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn HealthProbe>,
    router_config_path: PathBuf,
    slot: Arc<Mutex<Slot>>,
    published: Arc<watch::Sender<Snapshot>>,
    pending: StdMutex<Pending>,
}

impl Daemon {
    pub fn new(parts: DaemonParts) -> Self {
        let (published, _) = watch::channel(Snapshot::idle());
        Self {
            resolver: Resolver::new(parts.presets, parts.catalog, parts.puller, parts.defaults),
            launcher: parts.launcher,
            probe: parts.probe,
            router_config_path: parts.router_config_path,
            slot: Arc::new(Mutex::new(Slot::default())),
            published: Arc::new(published),
            pending: StdMutex::new(Pending::default()),
        }
    }

    pub fn state(&self) -> DaemonState {
        self.published.borrow().state
    }

    pub fn current_spec(&self) -> Option<Arc<LaunchSpec>> {
        self.published.borrow().spec.clone()
    }

    /// State and spec read together.
    pub fn snapshot(&self) -> Snapshot {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.published.subscribe()
    }

    /// Loads the target named by `raw`, replacing whatever is running.
    ///
    /// Returns the spec that is now `Running`. A later `run` or `kill`
    /// cancels this one while it is still pending.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        raw: &str,
        auto_pull: bool,
    ) -> Result<Arc<LaunchSpec>> {
        let identifier = Identifier::parse(raw)?;
        info!(identifier = %identifier, auto_pull, "Load requested");

        let (token, generation) = self.supersede(cancel);
        let result = self.run_locked(&token, &identifier, auto_pull).await;
        self.release(generation);

        match &result {
            Ok(spec) => info!(name = %spec.name, endpoint = %spec.endpoint(), "Model is running"),
            Err(e) => warn!(identifier = %identifier, "Load failed: {}", e),
        }
        result
    }

    async fn run_locked(
        &self,
        token: &CancellationToken,
        identifier: &Identifier,
        auto_pull: bool,
    ) -> Result<Arc<LaunchSpec>> {
        let mut slot = self.lock(token).await?;

        if slot.process.is_some() {
            // On failure the old process keeps running and nothing is published.
            self.stop_current(&mut slot, token).await?;
        }

        let spec = tokio::select! {
            biased;
            () = token.cancelled() => return Err(DaemonError::Cancelled),
            resolved = self.resolver.resolve(token, identifier, auto_pull) => Arc::new(resolved?),
        };

        self.publish(DaemonState::Loading, Some(Arc::clone(&spec)));

        let plan = match launch::plan(&spec, &self.router_config_path) {
            Ok(plan) => plan,
            Err(e) => {
                self.publish(DaemonState::Idle, None);
                return Err(e);
            }
        };
        slot.router_config = plan.router_config;

        let process = match self.launcher.start(&plan.args).await {
            Ok(process) => process,
            Err(e) => {
                remove_router_config(&mut slot).await;
                self.publish(DaemonState::Idle, None);
                return Err(e);
            }
        };
        let mut exits = process.exit_events();
        slot.process = Some(process);
        slot.session += 1;

        let endpoint = spec.endpoint();
        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => Err(DaemonError::HealthCheckCancelled),
            event = supervisor::wait_exit(&mut exits) => Err(DaemonError::ProcessExitedUnexpectedly(
                event.map(|e| e.to_string()).unwrap_or_else(|| "no exit status".into()),
            )),
            ready = self.probe.wait_ready(token, &endpoint) => ready,
        };
        // A superseded run never wins, even if its probe finished in the same instant.
        let outcome = match outcome {
            Ok(()) if token.is_cancelled() => Err(DaemonError::HealthCheckCancelled),
            other => other,
        };

        match outcome {
            Ok(()) => {
                self.publish(DaemonState::Running, Some(Arc::clone(&spec)));
                self.watch_for_exit(slot.session, exits);
                Ok(spec)
            }
            Err(e) => {
                self.abandon(&mut slot).await;
                Err(e)
            }
        }
    }

    /// Stops the current process and returns to `Idle`. A pending `run` is
    /// cancelled first. A failed stop leaves the published state untouched.
    pub async fn kill(&self, cancel: &CancellationToken) -> Result<()> {
        self.cancel_pending();
        let mut slot = self.lock(cancel).await?;

        if slot.process.is_none() && slot.router_config.is_none() {
            debug!("Kill requested while idle");
            self.publish(DaemonState::Idle, None);
            return Ok(());
        }

        info!("Unloading current model");
        self.stop_current(&mut slot, cancel).await
    }

    /// Kill with a fresh token; used on daemon exit.
    pub async fn shutdown(&self) {
        if let Err(e) = self.kill(&CancellationToken::new()).await {
            error!("Failed to stop server during shutdown: {}", e);
        }
    }

    pub async fn list_presets(&self) -> Result<Vec<String>> {
        self.resolver.presets().list().await
    }

    pub async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<CatalogEntry>> {
        self.resolver.catalog().list(cancel).await
    }

    /// Live model list when running in router mode.
    pub async fn router_models(&self) -> Option<Vec<RouterModel>> {
        let snapshot = self.snapshot();
        let spec = snapshot.spec.filter(|s| s.mode == Mode::Router)?;
        if snapshot.state != DaemonState::Running {
            return None;
        }
        self.probe.router_models(&spec.endpoint()).await
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, Slot>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(DaemonError::Cancelled),
            slot = self.slot.lock() => Ok(slot),
        }
    }

    /// Stops the slot's process, then clears the slot and publishes `Idle`.
    async fn stop_current(&self, slot: &mut Slot, cancel: &CancellationToken) -> Result<()> {
        if let Some(process) = slot.process.as_mut() {
            process.stop(cancel).await?;
        }
        slot.process = None;
        remove_router_config(slot).await;
        self.publish(DaemonState::Idle, None);
        Ok(())
    }

    /// Best-effort cleanup after a failed load. Never fails; a process that
    /// would not stop is killed when its handle drops.
    async fn abandon(&self, slot: &mut Slot) {
        if let Some(mut process) = slot.process.take() {
            if let Err(e) = process.stop(&CancellationToken::new()).await {
                error!(pid = ?process.pid(), "Cleanup after failed load could not stop server: {}", e);
            }
        }
        remove_router_config(slot).await;
        self.publish(DaemonState::Idle, None);
    }

    /// Returns `Idle` if the running process exits without being asked to.
    fn watch_for_exit(&self, session: u64, mut exits: watch::Receiver<Option<ExitEvent>>) {
        let slot = Arc::clone(&self.slot);
        let published = Arc::clone(&self.published);
        tokio::spawn(async move {
            let Some(event) = supervisor::wait_exit(&mut exits).await else {
                return;
            };
            if event.requested {
                return;
            }
            let mut slot = slot.lock().await;
            if slot.session != session || slot.process.is_none() {
                return;
            }
            warn!("Running server exited unexpectedly ({}), returning to idle", event);
            slot.process = None;
            remove_router_config(&mut slot).await;
            published.send_replace(Snapshot::idle());
        });
    }

    fn publish(&self, state: DaemonState, spec: Option<Arc<LaunchSpec>>) {
        debug!(state = %state, spec = ?spec.as_ref().map(|s| s.name.as_str()), "Publishing state");
        self.published.send_replace(Snapshot { state, spec });
    }

    /// Installs a new pending token derived from `cancel`, cancelling the
    /// previous one.
    fn supersede(&self, cancel: &CancellationToken) -> (CancellationToken, u64) {
        let token = cancel.child_token();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.token.replace(token.clone()) {
            debug!("Cancelling superseded load");
            previous.cancel();
        }
        pending.generation += 1;
        (token, pending.generation)
    }

    fn release(&self, generation: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.generation == generation {
            pending.token = None;
        }
    }

    fn cancel_pending(&self) {
        let token = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .token
            .take();
        if let Some(token) = token {
            debug!("Cancelling pending load");
            token.cancel();
        }
    }
}

async fn remove_router_config(slot: &mut Slot) {
    let Some(path) = slot.router_config.take() else {
        return;
    };
    match tokio::fs::remove_file(&path).await {
        Ok(()) => debug!(path = %path.display(), "Removed router configuration"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove router configuration: {}", e),
    }
}
