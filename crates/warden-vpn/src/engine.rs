//! Tunnel Engine seam
//!
//! The IKE/IPsec engine is opaque to the coordinator: it is started,
//! told to initiate, stopped, and reports numeric status codes back
//! through a [`StatusReporter`].
//!
//! # Threading contract
//!
//! - `initialize`, `initiate` and `deinitialize` are only ever called
//!   from the coordinator worker, never concurrently.
//! - `deinitialize` returns only once the engine has fully torn down.
//! - Status reports come from engine-owned threads and are serialized
//!   by the engine itself; they may race with the worker.

use crate::coordinator::StatusReporter;
use crate::state::ErrorState;
use std::path::PathBuf;
use std::sync::Arc;
use warden_iface::InterfaceBuilder;

/// Status codes reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    ChildSaUp,
    ChildSaDown,
    AuthError,
    PeerAuthError,
    LookupError,
    UnreachableError,
    GenericError,
}

impl EngineStatus {
    /// Decode a native status code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(EngineStatus::ChildSaUp),
            2 => Some(EngineStatus::ChildSaDown),
            3 => Some(EngineStatus::AuthError),
            4 => Some(EngineStatus::PeerAuthError),
            5 => Some(EngineStatus::LookupError),
            6 => Some(EngineStatus::UnreachableError),
            7 => Some(EngineStatus::GenericError),
            _ => None,
        }
    }

    /// Native status code
    pub fn code(&self) -> i32 {
        match self {
            EngineStatus::ChildSaUp => 1,
            EngineStatus::ChildSaDown => 2,
            EngineStatus::AuthError => 3,
            EngineStatus::PeerAuthError => 4,
            EngineStatus::LookupError => 5,
            EngineStatus::UnreachableError => 6,
            EngineStatus::GenericError => 7,
        }
    }

    /// Error classification, for the error codes
    pub fn error(&self) -> Option<ErrorState> {
        match self {
            EngineStatus::ChildSaUp | EngineStatus::ChildSaDown => None,
            EngineStatus::AuthError => Some(ErrorState::AuthFailed),
            EngineStatus::PeerAuthError => Some(ErrorState::PeerAuthFailed),
            EngineStatus::LookupError => Some(ErrorState::LookupFailed),
            EngineStatus::UnreachableError => Some(ErrorState::Unreachable),
            EngineStatus::GenericError => Some(ErrorState::Generic),
        }
    }
}

/// Optional engine features
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineFeatures {
    /// Trusted network connect / BYOD support
    pub byod: bool,
}

/// Everything the engine needs for one session
pub struct EngineContext {
    /// Interface builder scoped to the profile's session name
    pub builder: Arc<InterfaceBuilder>,
    /// Engine log file
    pub log_path: PathBuf,
    pub features: EngineFeatures,
    /// Handle for reporting status back to the coordinator
    pub reporter: StatusReporter,
}

/// The IKE/IPsec engine
pub trait TunnelEngine: Send {
    /// Bring the engine up for a new session
    fn initialize(&mut self, ctx: EngineContext) -> Result<(), EngineError>;

    /// Tear the engine down; returns once teardown is complete
    fn deinitialize(&mut self);

    /// Start negotiating the tunnel
    fn initiate(&mut self, tunnel_type: &str, gateway: &str, username: &str, password: &str);

    /// The device's connectivity changed
    fn network_changed(&mut self, _disconnected: bool) {}
}

/// Engine errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Engine initialization failed: {0}")]
    Init(String),

    #[error("Engine panicked: {0}")]
    Panicked(String),
}
