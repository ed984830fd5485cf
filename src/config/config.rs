use std::path::{Path, PathBuf};

use dimse::{DimseConfig, RemoteNode, DEFAULT_DIMSE_PORT};
use serde::Deserialize;
use thiserror::Error;

use crate::config::LoggingConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid [dimse] section: {0}")]
    InvalidDimse(String),
    #[error("Invalid [pacs] section: {0}")]
    InvalidRemote(String),
    #[error("Invalid [logging] section: {0}")]
    InvalidLogging(String),
    #[error("Invalid [filesystem] section: {0}")]
    InvalidFilesystem(String),
}

/// Offline source used by the filesystem client
#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemConfig {
    /// Directory scanned recursively for `*.dcm` files
    pub source_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dimse: DimseConfig,
    /// The archive queried by the network client
    pub pacs: RemoteNode,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub filesystem: Option<FilesystemConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dimse: DimseConfig::default(),
            pacs: RemoteNode::new("ANY-SCP", "127.0.0.1", DEFAULT_DIMSE_PORT),
            logging: LoggingConfig::default(),
            filesystem: None,
        }
    }
}

impl Config {
    /// Load and validate a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dimse
            .validate()
            .map_err(|e| ConfigError::InvalidDimse(e.to_string()))?;
        self.pacs
            .validate()
            .map_err(|e| ConfigError::InvalidRemote(e.to_string()))?;

        if self.logging.log_to_file && self.logging.log_file_path.trim().is_empty() {
            return Err(ConfigError::InvalidLogging(
                "log_file_path is required when log_to_file is enabled".to_string(),
            ));
        }

        if let Some(fs) = &self.filesystem {
            if fs.source_dir.as_os_str().is_empty() {
                return Err(ConfigError::InvalidFilesystem(
                    "source_dir cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
