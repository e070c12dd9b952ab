use super::core::Daemon;
use super::log_buffer::LogBuffer;
use super::protocol::{
    LoadData, LogsData, ModelsData, PingData, PresetsData, Request, Response, StatusData,
    MAX_REQUEST_BYTES,
};
use crate::clienv;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DaemonConfig {
    pub socket_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: clienv::daemon_socket_path(),
        }
    }
}

pub struct DaemonServer {
    config: DaemonConfig,
    daemon: Arc<Daemon>,
    log_buffer: Arc<LogBuffer>,
    started_at: Instant,
    version: String,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl DaemonServer {
    pub fn new(config: DaemonConfig, daemon: Arc<Daemon>, log_buffer: Arc<LogBuffer>) -> Self {
        Self {
            config,
            daemon,
            log_buffer,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: REQUEST_READ_TIMEOUT,
            shutdown: CancellationToken::new(),
        }
    }

    /// Bound on how long a client may take to send its request line.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Cancelling this token stops the accept loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!("modeld daemon starting...");

        #[cfg(unix)]
        let listener = bind_socket(&self.config.socket_path).await?;

        #[cfg(not(unix))]
        let listener = {
            let port = clienv::daemon_tcp_port();
            tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?
        };

        info!(
            "IPC server listening on: {}",
            self.config.socket_path.display()
        );

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let handle = self.shutdown.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                        handle.cancel();
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                        handle.cancel();
                    }
                    () = handle.cancelled() => {}
                }
            });
        }

        #[cfg(not(unix))]
        {
            let handle = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C");
                        handle.cancel();
                    }
                    () = handle.cancelled() => {}
                }
            });
        }

        let server = Arc::new(self);
        info!("modeld daemon ready");

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                () = server.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!("Stopping inference server...");
        server.daemon.shutdown().await;

        #[cfg(unix)]
        {
            if server.config.socket_path.exists() {
                std::fs::remove_file(&server.config.socket_path)?;
            }
        }

        info!("modeld daemon stopped");
        Ok(())
    }

    async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("New connection accepted");
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader).take(MAX_REQUEST_BYTES as u64 + 1);

        let mut line = Vec::new();
        let read = tokio::time::timeout(
            self.request_timeout,
            reader.read_until(b'\n', &mut line),
        )
        .await;

        let response = match read {
            Ok(Ok(0)) => {
                trace!("Connection closed without a request");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!("No complete request within {:?}", self.request_timeout);
                Response::error("timed out waiting for the request", Some("invalid_request"))
            }
            Ok(Ok(_)) if line.len() > MAX_REQUEST_BYTES => {
                warn!("Rejecting oversized request");
                Response::error(
                    format!("request exceeds {} bytes", MAX_REQUEST_BYTES),
                    Some("invalid_request"),
                )
            }
            Ok(Ok(_)) => match Request::decode(&line) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    debug!("Rejecting request: {}", e.message);
                    Response::from_decode_error(&e)
                }
            },
        };

        let bytes = response.encode().context("Failed to encode response")?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        let _ = writer.shutdown().await;

        trace!("Response sent");
        Ok(())
    }

    async fn handle_request(&self, request: Request) -> Response {
        debug!("Handling: {}", request.command());
        match request {
            Request::Ping => Response::ok(PingData {
                version: self.version.clone(),
                uptime_secs: self.started_at.elapsed().as_secs(),
            }),

            Request::Status => {
                let snapshot = self.daemon.snapshot();
                let models = self.daemon.router_models().await;
                let spec = snapshot.spec.as_deref();
                Response::ok(StatusData {
                    state: snapshot.state,
                    preset: spec.map(|s| s.name.clone()),
                    endpoint: spec.map(|s| s.endpoint()),
                    mode: spec.map(|s| s.mode),
                    models,
                })
            }

            Request::Load(args) => {
                let cancel = self.shutdown.child_token();
                match self
                    .daemon
                    .run(&cancel, &args.identifier, args.auto_pull)
                    .await
                {
                    Ok(spec) => Response::ok(LoadData {
                        endpoint: spec.endpoint(),
                    }),
                    Err(e) => Response::from_error(&e),
                }
            }

            Request::Unload => match self.daemon.kill(&self.shutdown.child_token()).await {
                Ok(()) => Response::ok_empty(),
                Err(e) => Response::from_error(&e),
            },

            Request::ListPresets => match self.daemon.list_presets().await {
                Ok(presets) => Response::ok(PresetsData { presets }),
                Err(e) => Response::from_error(&e),
            },

            Request::ListModels => {
                match self.daemon.list_models(&self.shutdown.child_token()).await {
                    Ok(models) => Response::ok(ModelsData { models }),
                    Err(e) => Response::from_error(&e),
                }
            }

            Request::Logs { lines } => Response::ok(LogsData {
                lines: self.log_buffer.tail(lines),
            }),

            Request::Shutdown => {
                info!("Handling: Shutdown");
                self.shutdown.cancel();
                Response::ok_empty()
            }
        }
    }
}

/// Binds the daemon socket, replacing a stale socket file but never one a
/// live daemon still answers on.
#[cfg(unix)]
async fn bind_socket(path: &std::path::Path) -> Result<tokio::net::UnixListener> {
    if path.exists() {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            anyhow::bail!("Daemon already running on {}", path.display());
        }
        info!(path = %path.display(), "Removing stale socket");
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}
