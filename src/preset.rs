//! Preset documents and the launch specifications resolved from them.
//!
//! A [`Preset`] is what the user wrote; a [`LaunchSpec`] is what the daemon
//! hands to the supervisor. Resolution only ever reads a preset and builds a
//! fresh spec, so a preset can be listed or resolved again unchanged.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

/// Value of the `mmproj` field that disables projector auto-detection.
pub const MMPROJ_NONE: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Single,
    Router,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Single => "single",
            Mode::Router => "router",
        }
    }
}

/// Free-form server option. Rendered as `--key value` or `key = value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Float(x) => write!(f, "{x}"),
            OptionValue::Text(s) => f.write_str(s),
        }
    }
}

pub type Options = BTreeMap<String, OptionValue>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Preset {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: Mode,
    pub model: Option<String>,
    pub draft_model: Option<String>,
    pub mmproj: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub models: Vec<PresetEntry>,
}

/// One model section of a router-mode preset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PresetEntry {
    pub name: String,
    pub model: Option<String>,
    pub draft_model: Option<String>,
    pub mmproj: Option<String>,
    #[serde(default)]
    pub options: Options,
}

impl Preset {
    /// Parses a TOML preset; `fallback_name` (usually the file stem) fills a
    /// missing `name`.
    pub fn from_toml(text: &str, fallback_name: &str) -> Result<Self> {
        let mut preset: Preset = toml::from_str(text)?;
        if preset.name.trim().is_empty() {
            preset.name = fallback_name.to_string();
        }
        preset.validate()?;
        Ok(preset)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| DaemonError::InvalidPreset {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        match self.mode {
            Mode::Single => {
                if self.model.as_deref().map_or(true, |m| m.trim().is_empty()) {
                    return Err(invalid("single mode requires `model`"));
                }
            }
            Mode::Router => {
                let has = |field: &Option<String>| {
                    field.as_deref().is_some_and(|v| !v.trim().is_empty())
                };
                if has(&self.draft_model) && !has(&self.model) {
                    return Err(invalid("top-level `draft-model` requires a top-level `model`"));
                }
                if self.models.is_empty() {
                    return Err(invalid("router mode requires at least one [[models]] entry"));
                }
                let mut seen = HashSet::new();
                for entry in &self.models {
                    if entry.name.trim().is_empty() {
                        return Err(invalid("router entries require a `name`"));
                    }
                    if !seen.insert(entry.name.as_str()) {
                        return Err(invalid(&format!("duplicate router entry '{}'", entry.name)));
                    }
                    if entry.model.as_deref().map_or(true, |m| m.trim().is_empty()) {
                        return Err(invalid(&format!("entry '{}' requires `model`", entry.name)));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Projector setting after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mmproj {
    Disabled,
    Path(PathBuf),
}

impl Mmproj {
    /// Interprets a user-supplied `mmproj` value; empty means "not set".
    pub fn from_user(raw: Option<&str>) -> Option<Self> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;
        if raw.eq_ignore_ascii_case(MMPROJ_NONE) {
            return Some(Mmproj::Disabled);
        }
        let path = raw.strip_prefix("f:").unwrap_or(raw);
        Some(Mmproj::Path(PathBuf::from(path)))
    }
}

/// Fully materialized launch parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchSpec {
    pub name: String,
    pub mode: Mode,
    /// Set in single mode only.
    pub model: Option<PathBuf>,
    pub draft_model: Option<PathBuf>,
    pub mmproj: Option<Mmproj>,
    pub host: String,
    pub port: u16,
    pub options: Options,
    /// Router-mode entries; empty in single mode.
    pub models: Vec<ModelSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSpec {
    pub name: String,
    pub model: PathBuf,
    pub draft_model: Option<PathBuf>,
    pub mmproj: Option<Mmproj>,
    pub options: Options,
}

impl LaunchSpec {
    /// Single-mode spec for a bare model file with default listen address.
    pub fn for_model_file(name: impl Into<String>, model: PathBuf, host: &str, port: u16) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Single,
            model: Some(model),
            draft_model: None,
            mmproj: None,
            host: host.to_string(),
            port,
            options: Options::new(),
            models: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}
