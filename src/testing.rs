//! In-memory collaborators for unit tests.

use crate::catalog::{CatalogEntry, ModelCatalog};
use crate::daemon::health::{HealthProbe, RouterModel};
use crate::daemon::supervisor::{ExitEvent, Launcher, ProcessHandle};
use crate::error::{DaemonError, Result};
use crate::preset::Preset;
use crate::preset_store::PresetStore;
use crate::puller::Puller;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MemoryPresetStore {
    presets: Mutex<BTreeMap<String, String>>,
    calls: AtomicUsize,
}

impl MemoryPresetStore {
    pub fn insert(&self, name: &str, toml: &str) {
        self.presets
            .lock()
            .unwrap()
            .insert(name.to_string(), toml.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresetStore for MemoryPresetStore {
    async fn load(&self, name: &str) -> Result<Preset> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self.presets.lock().unwrap().get(name).cloned();
        match text {
            Some(text) => Preset::from_toml(&text, name),
            None => Err(DaemonError::PresetNotFound(name.to_string())),
        }
    }

    async fn load_file(&self, path: &Path) -> Result<Preset> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.load(&stem).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.presets.lock().unwrap().keys().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    entries: Mutex<Vec<CatalogEntry>>,
    calls: AtomicUsize,
}

impl MemoryCatalog {
    pub fn insert(&self, repo: &str, quant: &str, path: &str) {
        self.add(repo, quant, path, None);
    }

    pub fn insert_with_mmproj(&self, repo: &str, quant: &str, path: &str, mmproj: &str) {
        self.add(repo, quant, path, Some(mmproj.to_string()));
    }

    fn add(&self, repo: &str, quant: &str, path: &str, mmproj: Option<String>) {
        let path = PathBuf::from(path);
        self.entries.lock().unwrap().push(CatalogEntry {
            repo: repo.to_string(),
            quant: quant.to_string(),
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path,
            size_bytes: 0,
            mmproj,
        });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn find(&self, repo: &str, quant: &str) -> Option<CatalogEntry> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.repo == repo && e.quant.eq_ignore_ascii_case(quant))
            .cloned()
    }
}

#[async_trait]
impl ModelCatalog for MemoryCatalog {
    async fn list(&self, _cancel: &CancellationToken) -> Result<Vec<CatalogEntry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().unwrap().clone())
    }

    async fn file_path(
        &self,
        _cancel: &CancellationToken,
        repo: &str,
        quant: &str,
    ) -> Result<Option<PathBuf>> {
        Ok(self.find(repo, quant).map(|e| e.path))
    }

    async fn details(
        &self,
        _cancel: &CancellationToken,
        repo: &str,
        quant: &str,
    ) -> Result<Option<CatalogEntry>> {
        Ok(self.find(repo, quant))
    }
}

/// Puller that "downloads" by adding pre-registered entries to a catalog.
pub struct RecordingPuller {
    catalog: Arc<MemoryCatalog>,
    available: Mutex<Vec<(String, String, String)>>,
    pulls: AtomicUsize,
}

impl RecordingPuller {
    pub fn new(catalog: Arc<MemoryCatalog>) -> Self {
        Self {
            catalog,
            available: Mutex::new(Vec::new()),
            pulls: AtomicUsize::new(0),
        }
    }

    pub fn provides(&self, repo: &str, quant: &str, path: &str) {
        self.available
            .lock()
            .unwrap()
            .push((repo.to_string(), quant.to_string(), path.to_string()));
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Puller for RecordingPuller {
    async fn pull(&self, _cancel: &CancellationToken, repo: &str, quant: &str) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let found = self
            .available
            .lock()
            .unwrap()
            .iter()
            .find(|(r, q, _)| r == repo && q == quant)
            .cloned();
        if let Some((repo, quant, path)) = found {
            self.catalog.insert(&repo, &quant, &path);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEvent {
    Start { pid: u32, args: Vec<String> },
    Stop { pid: u32 },
}

type ExitSender = Arc<watch::Sender<Option<ExitEvent>>>;

#[derive(Default)]
pub struct FakeLauncher {
    events: Arc<Mutex<Vec<LaunchEvent>>>,
    last_pid: AtomicU32,
    fail_next_start: AtomicBool,
    fail_stops: Arc<AtomicBool>,
    exit_on_start: Mutex<Option<Option<i32>>>,
    processes: Mutex<HashMap<u32, ExitSender>>,
}

impl FakeLauncher {
    pub fn events(&self) -> Vec<LaunchEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, LaunchEvent::Start { .. }))
            .count()
    }

    pub fn stops(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, LaunchEvent::Stop { .. }))
            .count()
    }

    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    /// The next started process exits on its own right away.
    pub fn exit_on_start(&self, code: Option<i32>) {
        *self.exit_on_start.lock().unwrap() = Some(code);
    }

    /// Makes process `pid` exit without being asked.
    pub fn crash(&self, pid: u32) {
        if let Some(exit) = self.processes.lock().unwrap().get(&pid) {
            exit.send_replace(Some(ExitEvent {
                code: Some(139),
                requested: false,
            }));
        }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn start(&self, args: &[String]) -> Result<Box<dyn ProcessHandle>> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(DaemonError::ProcessStartFailed("scripted failure".into()));
        }
        let pid = self.last_pid.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.lock().unwrap().push(LaunchEvent::Start {
            pid,
            args: args.to_vec(),
        });

        let (exit, _) = watch::channel(None);
        let exit = Arc::new(exit);
        if let Some(code) = self.exit_on_start.lock().unwrap().take() {
            exit.send_replace(Some(ExitEvent {
                code,
                requested: false,
            }));
        }
        self.processes.lock().unwrap().insert(pid, Arc::clone(&exit));

        Ok(Box::new(FakeProcess {
            pid,
            events: Arc::clone(&self.events),
            exit,
            fail_stops: Arc::clone(&self.fail_stops),
        }))
    }
}

pub struct FakeProcess {
    pid: u32,
    events: Arc<Mutex<Vec<LaunchEvent>>>,
    exit: ExitSender,
    fail_stops: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn exit_events(&self) -> watch::Receiver<Option<ExitEvent>> {
        self.exit.subscribe()
    }

    async fn stop(&mut self, _cancel: &CancellationToken) -> Result<()> {
        if self.exit.borrow().is_some() {
            return Ok(());
        }
        self.events
            .lock()
            .unwrap()
            .push(LaunchEvent::Stop { pid: self.pid });
        if self.fail_stops.load(Ordering::SeqCst) {
            return Err(DaemonError::StopFailed(format!("process {} is stuck", self.pid)));
        }
        self.exit.send_replace(Some(ExitEvent {
            code: Some(0),
            requested: true,
        }));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    Ready,
    TimeOut,
    /// Waits until cancelled.
    Block,
}

/// Probe that plays back queued steps, then reports ready.
#[derive(Default)]
pub struct ScriptedProbe {
    steps: Mutex<VecDeque<ProbeStep>>,
    router: Mutex<Option<Vec<RouterModel>>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn push(&self, step: ProbeStep) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn set_router_models(&self, models: Vec<RouterModel>) {
        *self.router.lock().unwrap() = Some(models);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn wait_ready(&self, cancel: &CancellationToken, _endpoint: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ProbeStep::Ready);
        match step {
            ProbeStep::Ready => Ok(()),
            ProbeStep::TimeOut => Err(DaemonError::HealthCheckTimeout(Duration::from_secs(1))),
            ProbeStep::Block => {
                cancel.cancelled().await;
                Err(DaemonError::HealthCheckCancelled)
            }
        }
    }

    async fn router_models(&self, _endpoint: &str) -> Option<Vec<RouterModel>> {
        self.router.lock().unwrap().clone()
    }
}
