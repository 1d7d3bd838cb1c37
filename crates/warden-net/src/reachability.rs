//! Reachability Guard
//!
//! Decides whether the current network attachment may carry the
//! tunnel. The guard holds nothing but its policy, so it can be shared
//! freely between the coordinator worker and the network monitor.

use crate::network::{NetworkKind, NetworkSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Which network attachments a tunnel may use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// Any network except while in airplane mode
    #[default]
    Any,
    /// Cellular data only; unmetered networks tear the tunnel down
    MobileOnly,
}

impl NetworkPolicy {
    /// Network kinds this policy forbids
    pub fn disallowed_kinds(&self) -> HashSet<NetworkKind> {
        match self {
            NetworkPolicy::Any => HashSet::new(),
            NetworkPolicy::MobileOnly => {
                [NetworkKind::Ethernet, NetworkKind::Wifi, NetworkKind::Wimax]
                    .into_iter()
                    .collect()
            }
        }
    }
}

/// Reachability policy check
#[derive(Debug, Clone)]
pub struct ReachabilityGuard {
    policy: NetworkPolicy,
    disallowed: HashSet<NetworkKind>,
}

impl ReachabilityGuard {
    /// Create a guard for the given policy
    pub fn new(policy: NetworkPolicy) -> Self {
        Self {
            policy,
            disallowed: policy.disallowed_kinds(),
        }
    }

    /// Active policy
    pub fn policy(&self) -> NetworkPolicy {
        self.policy
    }

    /// Check if a tunnel may run on this network.
    ///
    /// Missing network info counts as usable so that a transient gap in
    /// the OS signal never tears down a working tunnel.
    pub fn is_usable(&self, snapshot: &NetworkSnapshot) -> bool {
        if snapshot.airplane_mode {
            debug!("Network unusable: airplane mode");
            return false;
        }

        match snapshot.active {
            Some(info) if self.disallowed.contains(&info.kind) => {
                debug!("Network unusable: {} disallowed by {:?}", info.kind, self.policy);
                false
            }
            _ => true,
        }
    }
}

impl Default for ReachabilityGuard {
    fn default() -> Self {
        Self::new(NetworkPolicy::default())
    }
}
