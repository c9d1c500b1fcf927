//! Configuration for Courier contexts.
//!
//! Loaded from `~/.courier/config.toml` (or the file named by
//! `COURIER_CONFIG`). A missing file is not an error: every setting has a
//! default, and [`CourierConfig::default`] is a complete configuration.
//!
//! ```toml
//! [runtime]
//! default_shutdown = "drain"   # or "discard"
//! host_drain_budget = 64
//!
//! [contexts.worker]
//! stack_size = 4194304
//! shutdown = "discard"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use courier_core::ContextConfig;
use courier_types::ShutdownMode;

const CONFIG_ENV: &str = "COURIER_CONFIG";

const DEFAULT_HOST_DRAIN_BUDGET: usize = 64;

/// Smallest stack we hand to `std::thread::Builder`.
const MIN_STACK_SIZE: usize = 64 * 1024;

const fn default_host_drain_budget() -> usize {
    DEFAULT_HOST_DRAIN_BUDGET
}

#[derive(Debug, Default, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Per-context overrides, keyed by context name.
    #[serde(default)]
    pub contexts: HashMap<String, ContextSection>,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Mode a context uses when dropped without an explicit shutdown.
    #[serde(default)]
    pub default_shutdown: ShutdownMode,
    /// Most tasks a host loop runs per pump.
    #[serde(default = "default_host_drain_budget")]
    pub host_drain_budget: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_shutdown: ShutdownMode::default(),
            host_drain_budget: DEFAULT_HOST_DRAIN_BUDGET,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextSection {
    /// Thread stack size in bytes.
    pub stack_size: Option<usize>,
    /// Overrides `runtime.default_shutdown` for this context.
    pub shutdown: Option<ShutdownMode>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config at {}: {message}", path.display())]
    Invalid { path: PathBuf, message: String },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Invalid { path, .. } => path,
        }
    }
}

impl CourierConfig {
    /// Load from the default location. `Ok(None)` when no file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    /// Load from `path`. `Ok(None)` when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        let config: Self = match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        config
            .validate()
            .map_err(|message| ConfigError::Invalid {
                path: path.to_path_buf(),
                message,
            })?;
        Ok(Some(config))
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    fn validate(&self) -> Result<(), String> {
        if self.runtime.host_drain_budget == 0 {
            return Err("runtime.host_drain_budget must be at least 1".to_string());
        }
        let mut names: Vec<&String> = self.contexts.keys().collect();
        names.sort();
        for name in names {
            if name.trim().is_empty() {
                return Err("context names must not be empty".to_string());
            }
            if let Some(bytes) = self.contexts[name].stack_size
                && bytes < MIN_STACK_SIZE
            {
                return Err(format!(
                    "contexts.{name}.stack_size must be at least {MIN_STACK_SIZE} bytes"
                ));
            }
        }
        Ok(())
    }

    /// Settings for the context called `name`, falling back to runtime defaults.
    #[must_use]
    pub fn context(&self, name: &str) -> ContextConfig {
        let section = self.contexts.get(name);
        let shutdown = section
            .and_then(|s| s.shutdown)
            .unwrap_or(self.runtime.default_shutdown);
        let config = ContextConfig::new(name).with_shutdown(shutdown);
        match section.and_then(|s| s.stack_size) {
            Some(bytes) => config.with_stack_size(bytes),
            None => config,
        }
    }

    #[must_use]
    pub fn host_drain_budget(&self) -> usize {
        self.runtime.host_drain_budget
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV)
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".courier").join("config.toml"))
}
