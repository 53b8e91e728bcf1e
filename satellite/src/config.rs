// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with satellite configuration

use crate::worker_pool::DEFAULT_MAX_PARALLEL_HANDLERS;
use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use serde::Deserialize;
use stormesh_common::identity::NodeName;

/// Configuration for a satellite
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for the satellite debug log
    pub log: ConfigLogging,
    /// Name of the node this satellite runs on
    pub node_name: NodeName,
    #[serde(default)]
    pub device_manager: DeviceManagerConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceManagerConfig {
    /// Maximum number of device handlers running at the same time
    #[serde(default = "default_max_parallel_handlers")]
    pub max_parallel_handlers: usize,
}

fn default_max_parallel_handlers() -> usize {
    DEFAULT_MAX_PARALLEL_HANDLERS
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        DeviceManagerConfig {
            max_parallel_handlers: default_max_parallel_handlers(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Failed to initialize logger: {0}")]
    Logger(#[source] std::io::Error),
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }

    /// Builds the root logger described by the `[log]` section
    pub fn to_logger(&self, name: &str) -> Result<slog::Logger, ConfigError> {
        self.log.to_logger(name).map_err(ConfigError::Logger)
    }
}
