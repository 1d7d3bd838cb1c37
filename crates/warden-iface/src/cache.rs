//! Interface Configuration Cache
//!
//! Records the addresses, routes and MTU that went into an interface so
//! the same interface can be recreated later. DNS servers and search
//! domains are never recorded: they are resolved again on every full
//! establishment and deliberately left out of a re-establishment.

use crate::backend::{InterfaceError, PlatformBuilder};
use std::fmt;
use std::net::IpAddr;

/// An address or route with its prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrefixedAddress {
    /// Network address
    pub addr: IpAddr,
    /// Prefix length in bits
    pub prefix: u8,
}

impl PrefixedAddress {
    /// Create a prefixed address, rejecting prefixes longer than the address
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, InterfaceError> {
        if prefix > Self::max_prefix(addr) {
            return Err(InterfaceError::InvalidPrefix { addr, prefix });
        }
        Ok(Self { addr, prefix })
    }

    /// Longest valid prefix for the address family
    pub fn max_prefix(addr: IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// Check whether any host bits beyond the prefix are set
    pub fn has_host_bits(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4);
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                bits & !mask != 0
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6);
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                bits & !mask != 0
            }
        }
    }
}

impl fmt::Display for PrefixedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Non-DNS interface configuration.
///
/// Built incrementally while an interface is being configured. Once an
/// establishment succeeds the builder freezes it behind an `Arc`, after
/// which it is only ever read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceConfigCache {
    addresses: Vec<PrefixedAddress>,
    routes: Vec<PrefixedAddress>,
    mtu: Option<u32>,
}

impl InterfaceConfigCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_address(&mut self, address: PrefixedAddress) {
        self.addresses.push(address);
    }

    pub(crate) fn record_route(&mut self, route: PrefixedAddress) {
        self.routes.push(route);
    }

    pub(crate) fn record_mtu(&mut self, mtu: u32) {
        self.mtu = Some(mtu);
    }

    /// Interface addresses, in the order they were added
    pub fn addresses(&self) -> &[PrefixedAddress] {
        &self.addresses
    }

    /// Routes, in the order they were added
    pub fn routes(&self) -> &[PrefixedAddress] {
        &self.routes
    }

    /// Last MTU set, if any
    pub fn mtu(&self) -> Option<u32> {
        self.mtu
    }

    /// Check if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && self.routes.is_empty() && self.mtu.is_none()
    }

    /// Replay addresses, routes and MTU onto a fresh platform builder.
    pub(crate) fn apply(&self, platform: &mut dyn PlatformBuilder) -> Result<(), InterfaceError> {
        for address in &self.addresses {
            platform.add_address(*address)?;
        }
        for route in &self.routes {
            platform.add_route(*route)?;
        }
        if let Some(mtu) = self.mtu {
            platform.set_mtu(mtu)?;
        }
        Ok(())
    }
}
