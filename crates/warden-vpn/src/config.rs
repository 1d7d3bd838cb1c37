//! Coordinator Configuration
//!
//! Static policy handed to the coordinator at construction. Loads from
//! TOML or JSON.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use warden_net::NetworkPolicy;

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Which networks may carry the tunnel
    #[serde(default)]
    pub policy: NetworkPolicy,
    /// Engine log file
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    /// Tear the tunnel down when the engine reports a terminal error
    #[serde(default = "default_true")]
    pub disconnect_on_error: bool,
    /// Force BYOD engine features on for every profile
    #[serde(default)]
    pub byod: bool,
}

fn default_log_path() -> PathBuf {
    PathBuf::from("engine.log")
}

fn default_true() -> bool {
    true
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            policy: NetworkPolicy::default(),
            log_path: default_log_path(),
            disconnect_on_error: true,
            byod: false,
        }
    }
}

impl CoordinatorConfig {
    /// Configuration restricted to mobile networks
    pub fn mobile_only() -> Self {
        Self {
            policy: NetworkPolicy::MobileOnly,
            ..Self::default()
        }
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
