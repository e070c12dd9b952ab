//! Wire protocol: one newline-terminated JSON request and one
//! newline-terminated JSON response per connection.
//!
//! ```text
//! -> {"command":"load","args":{"identifier":"p:mistral"}}
//! <- {"status":"ok","data":{"endpoint":"http://127.0.0.1:8080"}}
//! ```

use super::core::DaemonState;
use super::health::RouterModel;
use crate::catalog::CatalogEntry;
use crate::error::{DaemonError, Result};
use crate::identifier::Identifier;
use crate::preset::Mode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest accepted request line, newline included.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

pub const DEFAULT_LOG_LINES: usize = 100;

/// Request exactly as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    Status,
    Load(LoadArgs),
    Unload,
    ListPresets,
    ListModels,
    Logs { lines: usize },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadArgs {
    pub identifier: String,
    pub auto_pull: bool,
}

#[derive(Debug, Deserialize)]
struct RawLoadArgs {
    identifier: Option<String>,
    /// Older clients send the target under this key.
    preset: Option<String>,
    #[serde(default)]
    auto_pull: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogsArgs {
    lines: Option<usize>,
}

/// Why a request line could not be turned into a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub code: &'static str,
    pub message: String,
}

impl DecodeError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_request",
            message: message.into(),
        }
    }
}

impl Request {
    pub fn command(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::Status => "status",
            Request::Load(_) => "load",
            Request::Unload => "unload",
            Request::ListPresets => "list_presets",
            Request::ListModels => "list_models",
            Request::Logs { .. } => "logs",
            Request::Shutdown => "shutdown",
        }
    }

    /// Decodes one request line (trailing newline optional).
    pub fn decode(line: &[u8]) -> std::result::Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_slice(line.trim_ascii())
            .map_err(|e| DecodeError::invalid(format!("malformed request: {e}")))?;
        let args = match envelope.args {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(args) => args,
        };

        match envelope.command.as_str() {
            "ping" => Ok(Request::Ping),
            "status" => Ok(Request::Status),
            "unload" => Ok(Request::Unload),
            "list_presets" => Ok(Request::ListPresets),
            "list_models" => Ok(Request::ListModels),
            "shutdown" => Ok(Request::Shutdown),
            "load" => {
                let raw: RawLoadArgs = parse_args(args)?;
                let identifier = match (raw.identifier, raw.preset) {
                    (Some(identifier), _) => identifier,
                    (None, Some(preset)) if Identifier::has_known_prefix(&preset) => preset,
                    (None, Some(preset)) => format!("p:{preset}"),
                    (None, None) => {
                        return Err(DecodeError::invalid("load requires an `identifier` argument"))
                    }
                };
                Ok(Request::Load(LoadArgs {
                    identifier,
                    auto_pull: raw.auto_pull,
                }))
            }
            "logs" => {
                let raw: RawLogsArgs = parse_args(args)?;
                Ok(Request::Logs {
                    lines: raw.lines.unwrap_or(DEFAULT_LOG_LINES),
                })
            }
            other => Err(DecodeError {
                code: "unknown_command",
                message: format!("unknown command '{other}'"),
            }),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let args = match self {
            Request::Load(load) => Some(serde_json::json!({
                "identifier": load.identifier,
                "auto_pull": load.auto_pull,
            })),
            Request::Logs { lines } => Some(serde_json::json!({ "lines": lines })),
            _ => None,
        };
        Envelope {
            command: self.command().to_string(),
            args,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(&self.to_envelope())?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

fn parse_args<T: DeserializeOwned>(args: Value) -> std::result::Result<T, DecodeError> {
    serde_json::from_value(args).map_err(|e| DecodeError::invalid(format!("invalid arguments: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// An error response received from the daemon.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub code: Option<String>,
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                status: Status::Ok,
                data: Some(data),
                error: None,
                error_code: None,
            },
            Err(e) => Self::error(format!("failed to encode response: {e}"), None),
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            status: Status::Ok,
            data: None,
            error: None,
            error_code: None,
        }
    }

    pub fn error(message: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            status: Status::Error,
            data: None,
            error: Some(message.into()),
            error_code: code.map(str::to_string),
        }
    }

    pub fn from_error(err: &DaemonError) -> Self {
        Self::error(err.to_string(), err.code())
    }

    pub fn from_decode_error(err: &DecodeError) -> Self {
        Self::error(err.message.clone(), Some(err.code))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn decode(line: &[u8]) -> Result<Self> {
        serde_json::from_slice(line.trim_ascii()).map_err(|e| {
            DaemonError::Protocol(format!("malformed response from daemon: {e}"))
        })
    }

    /// Splits into the payload or the daemon's error.
    pub fn into_result(self) -> std::result::Result<Option<Value>, RemoteError> {
        match self.status {
            Status::Ok => Ok(self.data),
            Status::Error => Err(RemoteError {
                message: self.error.unwrap_or_else(|| "unknown error".to_string()),
                code: self.error_code,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub state: DaemonState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<RouterModel>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadData {
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingData {
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetsData {
    pub presets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelsData {
    pub models: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsData {
    pub lines: Vec<String>,
}
