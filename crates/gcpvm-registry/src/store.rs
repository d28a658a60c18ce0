//! Configuration file storage
//!
//! Reads and atomically writes the JSON configuration file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::Configuration;

/// Errors reading or writing the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to locate home directory")]
    NoHomeDir,
}

/// Location of the configuration file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location, `~/.gcpvm/config.json`
    pub fn from_default_location() -> Result<Self, ConfigError> {
        Ok(Self::new(Self::default_path()?))
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".gcpvm").join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration from disk
    ///
    /// A missing file is an empty configuration, not an error.
    pub fn load(&self) -> Result<Configuration, ConfigError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "Config file not found, using empty configuration");
            return Ok(Configuration::default());
        }

        let json = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;

        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Load the configuration, creating the file with an empty configuration
    /// when it does not exist yet
    pub fn load_or_create(&self) -> Result<Configuration, ConfigError> {
        if self.path.exists() {
            return self.load();
        }

        let config = Configuration::default();
        self.save(&config)?;
        debug!(path = %self.path.display(), "Created config file");
        Ok(config)
    }

    /// Save the configuration to disk
    ///
    /// Writes to a temporary file in the same directory and renames it over
    /// the target, so readers see either the old or the new content.
    pub fn save(&self, config: &Configuration) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(write_err)?;

        let mut json = serde_json::to_string_pretty(config)?;
        json.push('\n');

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        debug!(path = %self.path.display(), projects = config.projects.len(), "Saved configuration");
        Ok(())
    }
}
