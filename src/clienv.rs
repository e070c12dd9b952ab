use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    ModeldConfigDir,
    ModeldDataDir,
    ModeldSocket,
    ModeldDaemonLog,
    ModeldDaemonTcpPort,
    ModeldServerBin,
    ModeldPresetsDir,
    ModeldModelsDir,
    HfToken,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::ModeldConfigDir => "MODELD_CONFIG_DIR",
            EnvVar::ModeldDataDir => "MODELD_DATA_DIR",
            EnvVar::ModeldSocket => "MODELD_SOCKET",
            EnvVar::ModeldDaemonLog => "MODELD_DAEMON_LOG",
            EnvVar::ModeldDaemonTcpPort => "MODELD_DAEMON_TCP_PORT",
            EnvVar::ModeldServerBin => "MODELD_SERVER_BIN",
            EnvVar::ModeldPresetsDir => "MODELD_PRESETS_DIR",
            EnvVar::ModeldModelsDir => "MODELD_MODELS_DIR",
            EnvVar::HfToken => "HF_TOKEN",
        }
    }
}

/// Value of `var`, treating empty as unset.
pub fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str())
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_path(var: EnvVar) -> Option<PathBuf> {
    env_opt(var).map(PathBuf::from)
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const FALLBACK_DATA_DIR: &str = "~/.local/share";
const MODELD_SUBDIR: &str = "modeld";
const DEFAULT_DAEMON_TCP_PORT: u16 = 14741;

/// Config directory ($MODELD_CONFIG_DIR or ~/.config/modeld)
pub fn config_dir() -> PathBuf {
    let dir = env_path(EnvVar::ModeldConfigDir).unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
            .join(MODELD_SUBDIR)
    });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Data directory ($MODELD_DATA_DIR or ~/.local/share/modeld)
pub fn data_dir() -> PathBuf {
    let dir = env_path(EnvVar::ModeldDataDir).unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
            .join(MODELD_SUBDIR)
    });
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Daemon socket path ($MODELD_SOCKET or <data_dir>/daemon.sock)
pub fn daemon_socket_path() -> PathBuf {
    let path = env_path(EnvVar::ModeldSocket).unwrap_or_else(|| data_dir().join("daemon.sock"));
    tracing::trace!(path = %path.display(), "Daemon socket path");
    path
}

/// Daemon log file path ($MODELD_DAEMON_LOG or <data_dir>/logs/daemon.log)
pub fn daemon_log_path() -> PathBuf {
    let path = env_path(EnvVar::ModeldDaemonLog)
        .unwrap_or_else(|| data_dir().join("logs").join("daemon.log"));
    tracing::trace!(path = %path.display(), "Daemon log path");
    path
}

/// Daemon TCP port for non-Unix platforms ($MODELD_DAEMON_TCP_PORT or 14741)
pub fn daemon_tcp_port() -> u16 {
    env_opt(EnvVar::ModeldDaemonTcpPort)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_DAEMON_TCP_PORT)
}

/// Generated router-mode model configuration (<data_dir>/router-models.ini)
pub fn router_config_path() -> PathBuf {
    data_dir().join("router-models.ini")
}

/// Server binary override ($MODELD_SERVER_BIN)
pub fn server_binary() -> Option<PathBuf> {
    env_path(EnvVar::ModeldServerBin)
}

/// Presets directory override ($MODELD_PRESETS_DIR)
pub fn presets_dir() -> Option<PathBuf> {
    env_path(EnvVar::ModeldPresetsDir)
}

/// Models directory override ($MODELD_MODELS_DIR)
pub fn models_dir() -> Option<PathBuf> {
    env_path(EnvVar::ModeldModelsDir)
}

/// Hugging Face access token ($HF_TOKEN)
pub fn hf_token() -> Option<String> {
    let token = env_opt(EnvVar::HfToken);
    tracing::trace!(present = token.is_some(), "HF_TOKEN env var");
    token
}
