//! Engine configuration
//!
//! Stored as JSON. Every field has a default, so partial files are fine.

use crate::backend::BackendConfig;
use crate::clock::PacingPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a pump round waits for a free input slot
    pub input_timeout_us: u64,
    /// How long a pump round waits for decoded output
    pub output_timeout_us: u64,
    pub pacing: PacingPolicy,
    /// Consecutive failed rounds before the session is torn down (0 = never)
    pub max_failed_rounds: u32,
    /// Render one frame right after create
    pub preview_on_create: bool,
    pub worker_name: String,
    pub backend: BackendConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_timeout_us: 2_000,
            output_timeout_us: 0,
            pacing: PacingPolicy::Advisory,
            max_failed_rounds: 64,
            preview_on_create: true,
            worker_name: "nativecodec-looper".to_string(),
            backend: BackendConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn input_timeout(&self) -> Duration {
        Duration::from_micros(self.input_timeout_us)
    }

    pub fn output_timeout(&self) -> Duration {
        Duration::from_micros(self.output_timeout_us)
    }

    /// `<config_dir>/nativecodec/engine.json`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("nativecodec");
        path.push("engine.json");
        path
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let config = Self::load(path)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
