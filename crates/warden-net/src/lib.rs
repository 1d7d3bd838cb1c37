//! Warden Network - network attachment model and reachability policy
//!
//! Describes the device's active network the way the OS reports it and
//! decides whether a tunnel may run over it.
//!
//! # Policies
//!
//! | Policy | Wi-Fi / Ethernet / WiMAX | Mobile | Airplane mode |
//! |--------|--------------------------|--------|---------------|
//! | `any` | allowed | allowed | blocked |
//! | `mobile_only` | blocked | allowed | blocked |

mod network;
mod reachability;

pub use network::{NetworkInfo, NetworkKind, NetworkProbe, NetworkSnapshot, SharedProbe};
pub use reachability::{NetworkPolicy, ReachabilityGuard};
