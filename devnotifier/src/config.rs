// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_DIR: &str = "devnotifier";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LoggingLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Which devices get tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFilter {
    /// Devices on removable or hotpluggable drives
    #[default]
    Removable,
    /// Devices on internal drives only
    NonRemovable,
    All,
}

impl DeviceFilter {
    pub fn accepts(self, removable: bool) -> bool {
        match self {
            Self::Removable => removable,
            Self::NonRemovable => !removable,
            Self::All => true,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("space_refresh_secs must be greater than zero")]
    InvalidRefreshInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: LoggingLevel,

    /// Seconds between free space refreshes while watching
    pub space_refresh_secs: u64,

    pub filter: DeviceFilter,

    /// Also write logs to this file
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LoggingLevel::Info,
            space_refresh_secs: 60,
            filter: DeviceFilter::Removable,
            log_file: None,
        }
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/devnotifier/config.toml`, falling back to `~/.config`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
            return Some(PathBuf::from(dir).join(CONFIG_DIR).join(CONFIG_FILE));
        }

        std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join(CONFIG_DIR)
                .join(CONFIG_FILE)
        })
    }

    /// Load the config file.
    ///
    /// An explicitly given path must exist. A missing file at the default
    /// location yields the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path, source },
            other => other,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;

        if config.space_refresh_secs == 0 {
            return Err(ConfigError::InvalidRefreshInterval);
        }

        Ok(config)
    }
}
