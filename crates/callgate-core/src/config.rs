//! Bridge configuration
//!
//! Sizing of the worker pool segments. Loaded from TOML or built in code;
//! every field has a default so a partial file is enough.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("The global offloader has already been initialised")]
    AlreadyInitialised,
}

/// Top-level configuration of the invocation bridge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Worker pool sizing
    pub offload: OffloadConfig,
}

impl BridgeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.offload.validate()
    }
}

/// How a saturated segment treats further submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Fail immediately when every worker is busy
    Reject,
    /// Let up to `depth` submissions wait for a worker; fail beyond that
    Bounded { depth: usize },
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::Bounded { depth: 256 }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Workers in the general segment
    pub workers: usize,

    /// Admission policy of the general segment
    pub queue: QueuePolicy,

    /// Workers reserved for release steps
    pub exit_workers: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            workers: 40,
            queue: QueuePolicy::default(),
            exit_workers: 1,
        }
    }
}

impl OffloadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_permits("workers", self.workers)?;
        check_permits("exit_workers", self.exit_workers)?;
        if let QueuePolicy::Bounded { depth } = self.queue {
            if depth > Semaphore::MAX_PERMITS {
                return Err(ConfigError::Invalid(format!(
                    "queue depth {} exceeds {}",
                    depth,
                    Semaphore::MAX_PERMITS
                )));
            }
        }
        Ok(())
    }
}

fn check_permits(field: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{} must be at least 1", field)));
    }
    if value > Semaphore::MAX_PERMITS {
        return Err(ConfigError::Invalid(format!(
            "{} must not exceed {}",
            field,
            Semaphore::MAX_PERMITS
        )));
    }
    Ok(())
}
