//! Network attachment snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Kind of the active network attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Mobile,
    Wifi,
    Ethernet,
    Wimax,
    Bluetooth,
    Vpn,
    Other,
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkKind::Mobile => "mobile",
            NetworkKind::Wifi => "wifi",
            NetworkKind::Ethernet => "ethernet",
            NetworkKind::Wimax => "wimax",
            NetworkKind::Bluetooth => "bluetooth",
            NetworkKind::Vpn => "vpn",
            NetworkKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// The OS view of the active network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Attachment kind
    pub kind: NetworkKind,
    /// Whether the network currently carries traffic
    pub connected: bool,
    /// Whether this network took over from another one
    #[serde(default)]
    pub failover: bool,
}

impl NetworkInfo {
    /// A connected network of the given kind
    pub fn connected(kind: NetworkKind) -> Self {
        Self {
            kind,
            connected: true,
            failover: false,
        }
    }
}

/// Point-in-time network signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    /// Active network, if the OS reports one
    pub active: Option<NetworkInfo>,
    /// Airplane mode switch
    #[serde(default)]
    pub airplane_mode: bool,
}

impl NetworkSnapshot {
    /// Snapshot with a single connected network
    pub fn on(kind: NetworkKind) -> Self {
        Self {
            active: Some(NetworkInfo::connected(kind)),
            airplane_mode: false,
        }
    }

    /// Snapshot with airplane mode enabled and no network
    pub fn airplane() -> Self {
        Self {
            active: None,
            airplane_mode: true,
        }
    }

    /// Check if there is no usable connectivity at all
    pub fn is_disconnected(&self) -> bool {
        self.active.is_none_or(|info| !info.connected)
    }
}

/// Source of the freshest network signal
pub trait NetworkProbe: Send + Sync {
    fn snapshot(&self) -> NetworkSnapshot;
}

/// Probe backed by a shared, externally updated snapshot
#[derive(Debug, Clone, Default)]
pub struct SharedProbe {
    current: Arc<RwLock<NetworkSnapshot>>,
}

impl SharedProbe {
    /// Create a probe starting at the given snapshot
    pub fn new(initial: NetworkSnapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(initial)),
        }
    }

    /// Replace the current snapshot
    pub fn set(&self, snapshot: NetworkSnapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

impl NetworkProbe for SharedProbe {
    fn snapshot(&self) -> NetworkSnapshot {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }
}
