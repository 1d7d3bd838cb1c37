//! Connection and error states published to listeners.

use serde::Serialize;
use std::fmt;

/// Tunnel connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// No tunnel, nothing pending
    #[default]
    Disabled,
    /// Engine started, waiting for the child SA
    Connecting,
    /// Child SA is up, traffic flows
    Connected,
    /// Engine is being torn down
    Disconnecting,
}

impl ConnectionState {
    /// Check if the tunnel carries traffic
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Name reported to external listeners
    pub fn external_name(&self) -> &'static str {
        match self {
            ConnectionState::Disabled => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnecting => "DISCONNECTING",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why the last connection attempt failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorState {
    #[default]
    NoError,
    AuthFailed,
    PeerAuthFailed,
    LookupFailed,
    Unreachable,
    Generic,
    DisallowedNetwork,
    Timeout,
}

impl ErrorState {
    /// Check if this is an actual error
    pub fn is_error(&self) -> bool {
        !matches!(self, ErrorState::NoError)
    }

    /// Name reported to external listeners.
    ///
    /// Peer authentication folds into `AUTH_FAILED` and lookup failures
    /// into `UNREACHABLE`; listeners do not distinguish them.
    pub fn external_name(&self) -> &'static str {
        match self {
            ErrorState::NoError => "NO_ERROR",
            ErrorState::AuthFailed | ErrorState::PeerAuthFailed => "AUTH_FAILED",
            ErrorState::LookupFailed | ErrorState::Unreachable => "UNREACHABLE",
            ErrorState::Generic => "UNKNOWN_ERROR",
            ErrorState::DisallowedNetwork => "DISALLOWED_NETWORK_TYPE",
            ErrorState::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why a disconnect was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Caller asked to disconnect
    User,
    /// The OS revoked VPN permission
    Revoked,
    /// The active network violates the reachability policy
    DisallowedNetwork,
    /// The connection timeout fired
    Timeout,
    /// The engine reported a terminal error
    EngineError,
    /// The coordinator is shutting down
    Shutdown,
}

impl DisconnectReason {
    /// Error published before the disconnect, if the reason carries one
    pub fn error(&self) -> Option<ErrorState> {
        match self {
            DisconnectReason::DisallowedNetwork => Some(ErrorState::DisallowedNetwork),
            _ => None,
        }
    }
}

/// Event delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum VpnEvent {
    State(ConnectionState),
    Error(ErrorState),
}

impl VpnEvent {
    /// Check if this event ends the listener's interest in the attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VpnEvent::Error(_) | VpnEvent::State(ConnectionState::Disabled)
        )
    }
}

/// Snapshot for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: ConnectionState,
    pub error: ErrorState,
    /// Name of the profile currently owning the tunnel
    pub profile: Option<String>,
    /// Whether the tunnel interface is up
    pub up: bool,
}

impl StatusReport {
    /// Serialize for the plugin layer
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
