//! Warden VPN - IKEv2 connection lifecycle coordinator
//!
//! Drives an opaque IKE/IPsec engine through connect, disconnect and
//! profile switches, with at most one tunnel alive at any time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ request_connect  ┌─────────────────────────────┐
//! │   Caller     │─────────────────▶│    ConnectionCoordinator     │
//! │ (UI / CLI)   │ request_disconnect│                             │
//! └──────▲───────┘                  │  next ──▶ worker thread     │
//!        │ VpnEvent                 │            │  ▲             │
//! ┌──────┴───────┐                  │  init/     │  │ status      │
//! │StateNotifier │◀─────────────────│  initiate  ▼  │ codes       │
//! │ + timeout    │                  │      ┌──────────────┐       │
//! └──────────────┘                  │      │ TunnelEngine │       │
//!                                   │      └──────┬───────┘       │
//! ┌──────────────┐  network change  │             │ builder       │
//! │NetworkMonitor│─────────────────▶│             ▼               │
//! └──────────────┘                  │      InterfaceBuilder       │
//!                                   └─────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Never two engine sessions at once: the previous one is fully
//!   deinitialized before the next is initialized
//! - Last request wins when requests arrive faster than the worker
//! - At most one error event per connection attempt
//! - Attempts that do not reach `Connected` in time fail with `Timeout`

mod config;
mod coordinator;
mod engine;
mod monitor;
mod notifier;
mod profile;
mod state;
mod timer;

#[cfg(test)]
mod mock;

pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{ConnectionCoordinator, CoordinatorError, StatusReporter};
pub use engine::{EngineContext, EngineError, EngineFeatures, EngineStatus, TunnelEngine};
pub use monitor::{MonitorMessage, NetworkMonitor};
pub use notifier::{FnListener, Retention, StateListener, StateNotifier, SubscriberId, UntilTerminal};
pub use profile::{Profile, ProfileError, TunnelType, DEFAULT_TIMEOUT};
pub use state::{ConnectionState, DisconnectReason, ErrorState, StatusReport, VpnEvent};
pub use timer::TimeoutTimer;
