//! VPN Profile
//!
//! One tunnel configuration: where to connect, how to authenticate and
//! how long to wait before giving up. Profiles are immutable once built
//! and compare equal by name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection timeout used when a profile does not set one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// IKEv2 authentication flavour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelType {
    /// EAP username/password
    Ikev2Eap,
    /// Client certificate
    Ikev2Cert,
    /// Client certificate plus EAP
    #[default]
    Ikev2CertEap,
    /// EAP with BYOD (trusted network connect) features
    Ikev2ByodEap,
}

impl TunnelType {
    /// Identifier understood by the tunnel engine
    pub fn identifier(&self) -> &'static str {
        match self {
            TunnelType::Ikev2Eap => "ikev2-eap",
            TunnelType::Ikev2Cert => "ikev2-cert",
            TunnelType::Ikev2CertEap => "ikev2-cert-eap",
            TunnelType::Ikev2ByodEap => "ikev2-byod-eap",
        }
    }

    /// Whether the engine must enable BYOD features
    pub fn enable_byod(&self) -> bool {
        matches!(self, TunnelType::Ikev2ByodEap)
    }

    /// Whether a client certificate is part of authentication
    pub fn uses_certificate(&self) -> bool {
        matches!(self, TunnelType::Ikev2Cert | TunnelType::Ikev2CertEap)
    }
}

/// Tunnel profile
#[derive(Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Profile name, also used as the interface session name
    pub name: String,
    /// Gateway host name or address
    pub gateway: String,
    pub username: String,
    pub password: String,
    /// Keystore alias of the client certificate (default: `username@gateway`)
    #[serde(default)]
    pub certificate_alias: Option<String>,
    #[serde(default)]
    pub tunnel_type: TunnelType,
    /// Give up if not connected within this time
    #[serde(
        rename = "timeout_ms",
        default = "default_timeout",
        with = "duration_ms"
    )]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl Profile {
    /// Create a profile with the default tunnel type and timeout
    pub fn new(
        name: impl Into<String>,
        gateway: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            gateway: gateway.into(),
            username: username.into(),
            password: password.into(),
            certificate_alias: None,
            tunnel_type: TunnelType::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the tunnel type
    pub fn with_tunnel_type(mut self, tunnel_type: TunnelType) -> Self {
        self.tunnel_type = tunnel_type;
        self
    }

    /// Set an explicit certificate alias
    pub fn with_certificate_alias(mut self, alias: impl Into<String>) -> Self {
        self.certificate_alias = Some(alias.into());
        self
    }

    /// Keystore alias of the client certificate
    pub fn certificate_alias(&self) -> String {
        self.certificate_alias
            .clone()
            .unwrap_or_else(|| format!("{}@{}", self.username, self.gateway))
    }

    /// Check that every required field is present
    pub fn validate(&self) -> Result<(), ProfileError> {
        let required = [
            ("name", &self.name),
            ("gateway", &self.gateway),
            ("username", &self.username),
            ("password", &self.password),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ProfileError::MissingField(field));
            }
        }
        if self.timeout.is_zero() {
            return Err(ProfileError::ZeroTimeout);
        }
        Ok(())
    }
}

impl PartialEq for Profile {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Profile {}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("name", &self.name)
            .field("gateway", &self.gateway)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("certificate_alias", &self.certificate_alias())
            .field("tunnel_type", &self.tunnel_type)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Profile errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Connection timeout must be non-zero")]
    ZeroTimeout,
}
