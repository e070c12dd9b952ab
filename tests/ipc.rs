#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use modeld::catalog::FsCatalog;
use modeld::daemon::client::ClientError;
use modeld::daemon::health::RouterModel;
use modeld::daemon::supervisor::ExitEvent;
use modeld::daemon::{
    Daemon, DaemonClient, DaemonConfig, DaemonParts, DaemonServer, DaemonState, HealthProbe,
    Launcher, LogBuffer, ProcessHandle,
};
use modeld::preset_store::FsPresetStore;
use modeld::puller::Puller;
use modeld::resolver::ListenDefaults;
use modeld::{DaemonError, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct StubProcess {
    pid: u32,
    exit: watch::Sender<Option<ExitEvent>>,
}

#[async_trait]
impl ProcessHandle for StubProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn exit_events(&self) -> watch::Receiver<Option<ExitEvent>> {
        self.exit.subscribe()
    }

    async fn stop(&mut self, _cancel: &CancellationToken) -> Result<()> {
        self.exit.send_replace(Some(ExitEvent {
            code: Some(0),
            requested: true,
        }));
        Ok(())
    }
}

#[derive(Default)]
struct StubLauncher {
    next_pid: AtomicU32,
    started: Mutex<Vec<Vec<String>>>,
}

impl StubLauncher {
    fn started(&self) -> Vec<Vec<String>> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl Launcher for StubLauncher {
    async fn start(&self, args: &[String]) -> Result<Box<dyn ProcessHandle>> {
        self.started.lock().unwrap().push(args.to_vec());
        let (exit, _) = watch::channel(None);
        Ok(Box::new(StubProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst) + 100,
            exit,
        }))
    }
}

struct AlwaysReady;

#[async_trait]
impl HealthProbe for AlwaysReady {
    async fn wait_ready(&self, _cancel: &CancellationToken, _endpoint: &str) -> Result<()> {
        Ok(())
    }

    async fn router_models(&self, _endpoint: &str) -> Option<Vec<RouterModel>> {
        None
    }
}

struct OfflinePuller;

#[async_trait]
impl Puller for OfflinePuller {
    async fn pull(&self, _cancel: &CancellationToken, repo: &str, _quant: &str) -> Result<()> {
        Err(DaemonError::Download(format!("offline: {repo}")))
    }
}

struct Running {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    launcher: Arc<StubLauncher>,
    client: DaemonClient,
    server: JoinHandle<anyhow::Result<()>>,
}

fn write_presets(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join("mistral.toml"),
        "model = \"h:org/Mistral-7B-GGUF:Q4_K_M\"\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("local.toml"),
        "model = \"/models/local.gguf\"\nport = 9001\n\n[options]\nctx-size = 4096\n",
    )
    .unwrap();
}

async fn start_daemon() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let presets_dir = dir.path().join("presets");
    write_presets(&presets_dir);
    let socket = dir.path().join("run").join("daemon.sock");

    let launcher = Arc::new(StubLauncher::default());
    let daemon = Arc::new(Daemon::new(DaemonParts {
        presets: Arc::new(FsPresetStore::new(&presets_dir)),
        catalog: Arc::new(FsCatalog::new(dir.path().join("models"))),
        puller: Arc::new(OfflinePuller),
        launcher: launcher.clone(),
        probe: Arc::new(AlwaysReady),
        defaults: ListenDefaults::default(),
        router_config_path: dir.path().join("router-models.ini"),
    }));

    let server = DaemonServer::new(
        DaemonConfig {
            socket_path: socket.clone(),
        },
        daemon,
        Arc::new(LogBuffer::default()),
    );
    let server = tokio::spawn(server.run());

    let client = DaemonClient::with_socket(&socket);
    for _ in 0..100 {
        if client.is_running().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(client.is_running().await, "daemon did not come up");

    Running {
        _dir: dir,
        socket,
        launcher,
        client,
        server,
    }
}

async fn raw_exchange(socket: &Path, payload: &[u8]) -> serde_json::Value {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (reader, mut writer) = tokio::io::split(stream);
    writer.write_all(payload).await.unwrap();
    writer.flush().await.unwrap();

    let mut line = Vec::new();
    BufReader::new(reader)
        .read_until(b'\n', &mut line)
        .await
        .unwrap();
    serde_json::from_slice(&line).unwrap()
}

async fn stop(running: Running) {
    running.client.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), running.server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert!(!running.socket.exists());
}

#[tokio::test]
async fn fresh_daemon_is_idle() {
    let running = start_daemon().await;

    let status = running.client.status().await.unwrap();
    assert_eq!(status.state, DaemonState::Idle);
    assert!(status.preset.is_none());
    assert!(status.endpoint.is_none());

    let ping = running.client.ping().await.unwrap();
    assert_eq!(ping.version, env!("CARGO_PKG_VERSION"));

    stop(running).await;
}

#[tokio::test]
async fn load_and_unload_a_preset() {
    let running = start_daemon().await;

    let loaded = running.client.load("p:local", false).await.unwrap();
    assert_eq!(loaded.endpoint, "http://127.0.0.1:9001");

    let status = running.client.status().await.unwrap();
    assert_eq!(status.state, DaemonState::Running);
    assert_eq!(status.preset.as_deref(), Some("local"));
    assert_eq!(status.endpoint.as_deref(), Some("http://127.0.0.1:9001"));

    let started = running.launcher.started();
    assert_eq!(started.len(), 1);
    assert!(started[0].windows(2).any(|w| w == ["-m", "/models/local.gguf"]));
    assert!(started[0].windows(2).any(|w| w == ["--ctx-size", "4096"]));

    running.client.unload().await.unwrap();
    let status = running.client.status().await.unwrap();
    assert_eq!(status.state, DaemonState::Idle);

    stop(running).await;
}

#[tokio::test]
async fn missing_model_is_reported_with_its_code() {
    let running = start_daemon().await;

    let err = running.client.load("p:mistral", false).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote(_)));
    assert_eq!(err.code(), Some("model_not_found"));
    assert!(running.launcher.started().is_empty());

    let status = running.client.status().await.unwrap();
    assert_eq!(status.state, DaemonState::Idle);

    stop(running).await;
}

#[tokio::test]
async fn unknown_preset_and_bad_identifier_are_distinguished() {
    let running = start_daemon().await;

    let err = running.client.load("p:nope", false).await.unwrap_err();
    assert_eq!(err.code(), Some("preset_not_found"));

    let err = running.client.load("x:what", false).await.unwrap_err();
    assert_eq!(err.code(), Some("invalid_identifier"));

    stop(running).await;
}

#[tokio::test]
async fn lists_presets_sorted() {
    let running = start_daemon().await;

    let presets = running.client.list_presets().await.unwrap();
    assert_eq!(presets, vec!["local".to_string(), "mistral".to_string()]);

    let models = running.client.list_models().await.unwrap();
    assert!(models.models.is_empty());

    stop(running).await;
}

#[tokio::test]
async fn malformed_and_unknown_requests_get_error_responses() {
    let running = start_daemon().await;

    let reply = raw_exchange(&running.socket, b"this is not json\n").await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["error_code"], "invalid_request");

    let reply = raw_exchange(&running.socket, b"{\"command\":\"reboot\"}\n").await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["error_code"], "unknown_command");

    let reply = raw_exchange(&running.socket, b"{\"command\":\"status\"}\n").await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["data"]["state"], "idle");

    stop(running).await;
}

#[tokio::test]
async fn legacy_preset_argument_is_accepted() {
    let running = start_daemon().await;

    let reply = raw_exchange(
        &running.socket,
        b"{\"command\":\"load\",\"args\":{\"preset\":\"local\"}}\n",
    )
    .await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["data"]["endpoint"], "http://127.0.0.1:9001");

    stop(running).await;
}

#[tokio::test]
async fn second_daemon_refuses_a_live_socket() {
    let running = start_daemon().await;

    let daemon = Arc::new(Daemon::new(DaemonParts {
        presets: Arc::new(FsPresetStore::new(running.socket.with_file_name("none"))),
        catalog: Arc::new(FsCatalog::new(running.socket.with_file_name("none"))),
        puller: Arc::new(OfflinePuller),
        launcher: Arc::new(StubLauncher::default()),
        probe: Arc::new(AlwaysReady),
        defaults: ListenDefaults::default(),
        router_config_path: running.socket.with_file_name("router.ini"),
    }));
    let second = DaemonServer::new(
        DaemonConfig {
            socket_path: running.socket.clone(),
        },
        daemon,
        Arc::new(LogBuffer::default()),
    );
    assert!(second.run().await.is_err());
    assert!(running.client.is_running().await);

    stop(running).await;
}
