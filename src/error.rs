use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("invalid identifier '{raw}': {reason}")]
    InvalidIdentifier { raw: String, reason: String },

    #[error("preset not found: {0}")]
    PresetNotFound(String),

    #[error("model not found in catalog: {repo}:{quant}")]
    ModelNotFound { repo: String, quant: String },

    #[error("failed to start server process: {0}")]
    ProcessStartFailed(String),

    #[error("server process exited unexpectedly ({0})")]
    ProcessExitedUnexpectedly(String),

    #[error("server did not become ready within {}s", .0.as_secs())]
    HealthCheckTimeout(Duration),

    #[error("load cancelled before the server became ready")]
    HealthCheckCancelled,

    #[error("failed to stop server process: {0}")]
    StopFailed(String),

    #[error("failed to write router config {}: {source}", path.display())]
    ConfigWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid preset '{name}': {reason}")]
    InvalidPreset { name: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DaemonError {
    /// Stable machine-readable code surfaced as `error_code` on the wire.
    ///
    /// Errors without a code still reach clients as a plain message.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidIdentifier { .. } => Some("invalid_identifier"),
            Self::PresetNotFound(_) => Some("preset_not_found"),
            Self::ModelNotFound { .. } => Some("model_not_found"),
            Self::ProcessStartFailed(_) => Some("process_start_failed"),
            Self::ProcessExitedUnexpectedly(_) => Some("process_exited"),
            Self::HealthCheckTimeout(_) => Some("health_check_timeout"),
            Self::HealthCheckCancelled => Some("health_check_cancelled"),
            Self::StopFailed(_) => Some("stop_failed"),
            Self::ConfigWriteFailed { .. } => Some("config_write_failed"),
            Self::InvalidPreset { .. } => Some("invalid_preset"),
            Self::Cancelled
            | Self::Config(_)
            | Self::Protocol(_)
            | Self::Download(_)
            | Self::Http(_)
            | Self::Io(_)
            | Self::Toml(_)
            | Self::Serialization(_) => None,
        }
    }

    pub(crate) fn invalid_identifier(raw: &str, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
