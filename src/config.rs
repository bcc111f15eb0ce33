//! Server configuration.
//!
//! Layers, later wins: built-in defaults, an optional TOML file, `STATEHOUSE_*` environment
//! variables, then command-line flags (applied by the binary).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_STATE_ADDRESS: &str = "127.0.0.1:7400";
pub const DEFAULT_WATCH_ADDRESS: &str = "127.0.0.1:7401";
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 0 = errors only, 1 = info, 2+ = debug.
    pub verbosity: u8,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            verbosity: 1,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the request/reply channel listens.
    pub state_address: String,
    /// Where the watch channel listens. Advertised to clients through `get_server_meta`.
    pub watch_address: String,
    pub max_frame_bytes: usize,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_address: DEFAULT_STATE_ADDRESS.to_string(),
            watch_address: DEFAULT_WATCH_ADDRESS.to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Defaults overlaid with `path` (when given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => read_file(path)?,
            None => Config::default(),
        };
        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

fn apply_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(raw) = var("STATEHOUSE_STATE_ADDR") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            config.state_address = trimmed.to_string();
        }
    }

    if let Some(raw) = var("STATEHOUSE_WATCH_ADDR") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            config.watch_address = trimmed.to_string();
        }
    }

    if let Some(raw) = var("STATEHOUSE_MAX_FRAME_BYTES") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<usize>() {
                Ok(0) => tracing::warn!("STATEHOUSE_MAX_FRAME_BYTES must be positive, ignoring"),
                Ok(value) => config.max_frame_bytes = value,
                Err(err) => tracing::warn!("invalid STATEHOUSE_MAX_FRAME_BYTES, ignoring: {err}"),
            }
        }
    }
}
