//! OS-facing builder seam.

use crate::cache::PrefixedAddress;
use std::net::IpAddr;

/// Raw TUN descriptor handed to the tunnel engine, which takes ownership.
pub type RawTunFd = i32;

/// Descriptor value engines receive when establishment failed.
pub const INVALID_FD: RawTunFd = -1;

/// One in-progress OS interface configuration.
///
/// Implementations validate each value the way the platform does and
/// reject it with an error instead of panicking. A rejected call must
/// leave previously accepted values in place.
pub trait PlatformBuilder: Send {
    fn add_address(&mut self, address: PrefixedAddress) -> Result<(), InterfaceError>;

    fn add_route(&mut self, route: PrefixedAddress) -> Result<(), InterfaceError>;

    fn add_dns_server(&mut self, server: IpAddr) -> Result<(), InterfaceError>;

    fn add_search_domain(&mut self, domain: &str) -> Result<(), InterfaceError>;

    fn set_mtu(&mut self, mtu: u32) -> Result<(), InterfaceError>;

    /// Commit the configuration and open the interface.
    ///
    /// `Ok(None)` means the OS declined without reporting an error
    /// (for example, the user revoked VPN permission meanwhile).
    fn establish(&mut self) -> Result<Option<RawTunFd>, InterfaceError>;
}

/// Factory for fresh platform builders, one per establishment.
pub trait InterfaceBackend: Send + Sync {
    /// Create an empty builder labelled with the session name.
    fn new_builder(&self, session: &str) -> Box<dyn PlatformBuilder>;
}

/// Interface configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceError {
    #[error("Prefix length {prefix} is invalid for {addr}")]
    InvalidPrefix { addr: IpAddr, prefix: u8 },

    #[error("Invalid MTU: {0}")]
    InvalidMtu(u32),

    #[error("Invalid search domain: {0:?}")]
    InvalidDomain(String),

    #[error("Rejected by platform: {0}")]
    Rejected(String),

    #[error("Platform returned no interface descriptor")]
    NoDescriptor,

    #[error("No established configuration to replay")]
    NotEstablished,
}
