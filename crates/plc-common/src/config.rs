//! Process-level configuration for the agent and server binaries.
//!
//! This is deliberately separate from the *wire-level* agent configuration
//! (`server_url`, `node_id`, `plcs: [...]`) that travels over HTTP and is
//! hot-reloaded at runtime (see `plc_agent::config`). This module covers
//! only what an operator sets once at process start: where to find things,
//! how verbosely to log, and which address to bind.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process configuration for the `plc-agent` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProcessConfig {
    /// Path to the local wire-format config (`client_config.json`).
    pub config_path: PathBuf,

    /// Directory agents use for their own interaction log state; currently
    /// informational only, the log queue itself lives in process memory.
    pub state_dir: PathBuf,

    /// Log verbosity passed to `tracing_subscriber`'s env filter.
    pub log_level: String,

    /// Per-request timeout for calls to the server.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for AgentProcessConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("client_config.json"),
            state_dir: PathBuf::from("."),
            log_level: String::from("info"),
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Process configuration for the `plc-server` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerProcessConfig {
    /// Address the HTTP control plane binds to.
    pub bind_addr: String,

    /// Directory containing profile JSON files.
    pub profiles_dir: PathBuf,

    /// Log verbosity passed to `tracing_subscriber`'s env filter.
    pub log_level: String,
}

impl Default for ServerProcessConfig {
    fn default() -> Self {
        Self {
            bind_addr: String::from("0.0.0.0:8000"),
            profiles_dir: PathBuf::from("profiles"),
            log_level: String::from("info"),
        }
    }
}

impl AgentProcessConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }
}

impl ServerProcessConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
