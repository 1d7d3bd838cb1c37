//! Application configuration file.
//!
//! ```toml
//! network = "mobile"
//!
//! [coordinator]
//! policy = "mobile_only"
//!
//! [[profiles]]
//! name = "corp"
//! gateway = "vpn.example.com"
//! username = "alice"
//! password = "secret"
//! timeout_ms = 10000
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use warden_net::NetworkKind;
use warden_vpn::{CoordinatorConfig, Profile};

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Network the device starts on
    #[serde(default = "default_network")]
    pub network: NetworkKind,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

fn default_network() -> NetworkKind {
    NetworkKind::Mobile
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        for profile in &config.profiles {
            profile
                .validate()
                .with_context(|| format!("profile '{}'", profile.name))?;
        }
        Ok(config)
    }

    /// Profile by name, or the first one
    pub fn select(&self, name: Option<&str>) -> Result<Profile> {
        let found = match name {
            Some(name) => self.profiles.iter().find(|p| p.name == name),
            None => self.profiles.first(),
        };
        match found {
            Some(profile) => Ok(profile.clone()),
            None if self.profiles.is_empty() => bail!("no profiles configured"),
            None => bail!("no profile named '{}'", name.unwrap_or_default()),
        }
    }
}
