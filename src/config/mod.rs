//! Configuration module
//!
//! Handles the TOML settings file and its resolution into a driver
//! configuration

mod settings;

pub use settings::{AppConfig, DeviceConfig, LoggingConfig, SensorConfig, SensorsConfig};

use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform configuration directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File could not be read or written
    #[error("{path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be written as TOML
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values are inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "geigerd", "geigerd")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the default configuration file path
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Get the default log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}
