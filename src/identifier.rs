//! Launch-target identifiers.
//!
//! Every load request names its target with a prefixed string:
//!
//! - `h:owner/repo:QUANT` - a Hugging Face GGUF repository and quantization
//! - `p:name` - a preset from the preset directory
//! - `f:/path/to/file` - a preset file (`.toml`) or a model file (anything else)

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{DaemonError, Result};

/// File suffixes that mark an `f:` path as a preset file rather than a model.
pub const PRESET_FILE_SUFFIXES: &[&str] = &[".toml"];

const HF_PREFIX: &str = "h:";
const PRESET_PREFIX: &str = "p:";
const FILE_PREFIX: &str = "f:";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    PresetName(String),
    ModelFile(PathBuf),
    PresetFile(PathBuf),
    HuggingFace { repo: String, quant: String },
}

impl Identifier {
    /// Parses a prefixed launch target. Pure; never touches the filesystem.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();

        if let Some(rest) = trimmed.strip_prefix(HF_PREFIX) {
            let (repo, quant) = parse_hf(raw, rest)?;
            return Ok(Self::HuggingFace { repo, quant });
        }

        if let Some(name) = trimmed.strip_prefix(PRESET_PREFIX) {
            if name.is_empty() {
                return Err(DaemonError::invalid_identifier(raw, "empty preset name"));
            }
            if name.contains(':') {
                return Err(DaemonError::invalid_identifier(
                    raw,
                    "preset names cannot contain ':'",
                ));
            }
            return Ok(Self::PresetName(name.to_string()));
        }

        if let Some(path) = trimmed.strip_prefix(FILE_PREFIX) {
            if path.is_empty() {
                return Err(DaemonError::invalid_identifier(raw, "empty file path"));
            }
            let path = PathBuf::from(path);
            return Ok(if is_preset_file(&path) {
                Self::PresetFile(path)
            } else {
                Self::ModelFile(path)
            });
        }

        Err(DaemonError::invalid_identifier(
            raw,
            "expected one of the prefixes h:, p:, f:",
        ))
    }

    /// Whether `raw` starts with one of the recognized prefixes.
    pub fn has_known_prefix(raw: &str) -> bool {
        let trimmed = raw.trim();
        [HF_PREFIX, PRESET_PREFIX, FILE_PREFIX]
            .iter()
            .any(|prefix| trimmed.starts_with(prefix))
    }
}

impl FromStr for Identifier {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PresetName(name) => write!(f, "{PRESET_PREFIX}{name}"),
            Self::ModelFile(path) | Self::PresetFile(path) => {
                write!(f, "{FILE_PREFIX}{}", path.display())
            }
            Self::HuggingFace { repo, quant } => write!(f, "{HF_PREFIX}{repo}:{quant}"),
        }
    }
}

/// A model reference embedded in a preset (`model`, `draft-model`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelRef {
    HuggingFace { repo: String, quant: String },
    Path(PathBuf),
}

impl ModelRef {
    /// `h:` references go through the catalog, `f:` has its prefix stripped,
    /// and anything else is taken as a literal path.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if let Some(rest) = trimmed.strip_prefix(HF_PREFIX) {
            let (repo, quant) = parse_hf(raw, rest)?;
            return Ok(Self::HuggingFace { repo, quant });
        }
        let path = trimmed.strip_prefix(FILE_PREFIX).unwrap_or(trimmed);
        if path.is_empty() {
            return Err(DaemonError::invalid_identifier(raw, "empty model path"));
        }
        Ok(Self::Path(PathBuf::from(path)))
    }
}

fn parse_hf(raw: &str, rest: &str) -> Result<(String, String)> {
    let Some((repo, quant)) = rest.rsplit_once(':') else {
        return Err(DaemonError::invalid_identifier(
            raw,
            "missing quantization (expected h:owner/repo:QUANT)",
        ));
    };
    if quant.is_empty() {
        return Err(DaemonError::invalid_identifier(raw, "empty quantization"));
    }

    let valid_repo = match repo.split_once('/') {
        Some((owner, name)) => {
            !owner.is_empty() && !name.is_empty() && !name.contains('/') && !repo.contains(':')
        }
        None => false,
    };
    if !valid_repo {
        return Err(DaemonError::invalid_identifier(
            raw,
            "repository must look like owner/repo",
        ));
    }

    Ok((repo.to_string(), quant.to_string()))
}

fn is_preset_file(path: &Path) -> bool {
    let name = path.to_string_lossy().to_ascii_lowercase();
    PRESET_FILE_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(suffix))
}
