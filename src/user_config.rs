use crate::clienv;
use crate::daemon::health::ProbeSettings;
use crate::resolver::ListenDefaults;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SERVER_BINARY: &str = "llama-server";
const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Contents of `config.toml`. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserConfig {
    /// llama.cpp server executable (name on PATH or absolute path)
    pub server_binary: Option<PathBuf>,
    /// Default listen host for presets that do not set one
    pub host: Option<String>,
    /// Default listen port for presets that do not set one
    pub port: Option<u16>,
    pub health_timeout_secs: Option<u64>,
    pub health_probe_timeout_ms: Option<u64>,
    pub health_interval_ms: Option<u64>,
    pub stop_timeout_secs: Option<u64>,
    pub presets_dir: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    pub hf_endpoint: Option<String>,
}

impl UserConfig {
    /// $MODELD_CONFIG_DIR/config.toml or ~/.config/modeld/config.toml
    pub fn config_path() -> PathBuf {
        clienv::config_dir().join("config.toml")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading user config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(?config, "User config loaded");
        Ok(config)
    }
}

/// Effective settings: environment, then `config.toml`, then defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server_binary: PathBuf,
    pub listen: ListenDefaults,
    pub probe: ProbeSettings,
    pub stop_timeout: Duration,
    pub presets_dir: PathBuf,
    pub models_dir: PathBuf,
    pub hf_endpoint: String,
    pub hf_token: Option<String>,
    pub router_config_path: PathBuf,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Ok(Self::from_config(UserConfig::load()?))
    }

    pub fn from_config(config: UserConfig) -> Self {
        let listen_defaults = ListenDefaults::default();
        let probe_defaults = ProbeSettings::default();

        Self {
            server_binary: clienv::server_binary()
                .or(config.server_binary)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_BINARY)),
            listen: ListenDefaults {
                host: config.host.unwrap_or(listen_defaults.host),
                port: config.port.unwrap_or(listen_defaults.port),
            },
            probe: ProbeSettings {
                timeout: config
                    .health_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(probe_defaults.timeout),
                probe_timeout: config
                    .health_probe_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(probe_defaults.probe_timeout),
                interval: config
                    .health_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(probe_defaults.interval),
            },
            stop_timeout: Duration::from_secs(
                config.stop_timeout_secs.unwrap_or(DEFAULT_STOP_TIMEOUT_SECS),
            ),
            presets_dir: clienv::presets_dir()
                .or(config.presets_dir)
                .unwrap_or_else(|| clienv::config_dir().join("presets")),
            models_dir: clienv::models_dir()
                .or(config.models_dir)
                .unwrap_or_else(|| clienv::data_dir().join("models")),
            hf_endpoint: config
                .hf_endpoint
                .unwrap_or_else(|| DEFAULT_HF_ENDPOINT.to_string()),
            hf_token: clienv::hf_token(),
            router_config_path: clienv::router_config_path(),
        }
    }
}
