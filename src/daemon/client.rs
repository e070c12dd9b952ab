use super::protocol::{
    LoadArgs, LoadData, LogsData, ModelsData, PingData, PresetsData, RemoteError, Request,
    Response, StatusData,
};
use crate::clienv;
use crate::error::DaemonError;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon is not running (no socket at {})", .0.display())]
    NotRunning(PathBuf),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Transport(#[from] DaemonError),
}

impl ClientError {
    /// The daemon's `error_code`, if the daemon reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Remote(e) => e.code.as_deref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Transport(e.into())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Talks to a running daemon, one connection per request.
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new() -> Self {
        Self::with_socket(clienv::daemon_socket_path())
    }

    pub fn with_socket(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Sends one request and returns the raw response.
    pub async fn send(&self, request: &Request) -> ClientResult<Response> {
        #[cfg(unix)]
        let stream = tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .map_err(|_| ClientError::NotRunning(self.socket_path.clone()))?;

        #[cfg(not(unix))]
        let stream = tokio::net::TcpStream::connect(format!("127.0.0.1:{}", clienv::daemon_tcp_port()))
            .await
            .map_err(|_| ClientError::NotRunning(self.socket_path.clone()))?;

        trace!(command = request.command(), "Sending request");
        let (reader, mut writer) = tokio::io::split(stream);
        writer.write_all(&request.encode()?).await?;
        writer.flush().await?;

        let mut line = Vec::new();
        BufReader::new(reader).read_until(b'\n', &mut line).await?;
        if line.is_empty() {
            return Err(DaemonError::Protocol("daemon closed the connection".into()).into());
        }
        Ok(Response::decode(&line)?)
    }

    async fn call<T: DeserializeOwned>(&self, request: &Request) -> ClientResult<T> {
        let data = self.send(request).await?.into_result()?;
        let data = data.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(|e| ClientError::Transport(e.into()))
    }

    async fn call_unit(&self, request: &Request) -> ClientResult<()> {
        self.send(request).await?.into_result()?;
        Ok(())
    }

    pub async fn ping(&self) -> ClientResult<PingData> {
        self.call(&Request::Ping).await
    }

    pub async fn status(&self) -> ClientResult<StatusData> {
        self.call(&Request::Status).await
    }

    pub async fn load(&self, identifier: &str, auto_pull: bool) -> ClientResult<LoadData> {
        self.call(&Request::Load(LoadArgs {
            identifier: identifier.to_string(),
            auto_pull,
        }))
        .await
    }

    pub async fn unload(&self) -> ClientResult<()> {
        self.call_unit(&Request::Unload).await
    }

    pub async fn list_presets(&self) -> ClientResult<Vec<String>> {
        let data: PresetsData = self.call(&Request::ListPresets).await?;
        Ok(data.presets)
    }

    pub async fn list_models(&self) -> ClientResult<ModelsData> {
        self.call(&Request::ListModels).await
    }

    pub async fn logs(&self, lines: usize) -> ClientResult<Vec<String>> {
        let data: LogsData = self.call(&Request::Logs { lines }).await?;
        Ok(data.lines)
    }

    pub async fn shutdown(&self) -> ClientResult<()> {
        self.call_unit(&Request::Shutdown).await
    }

    /// Polls until the daemon socket is gone.
    pub async fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.socket_exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        !self.socket_exists()
    }
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}
