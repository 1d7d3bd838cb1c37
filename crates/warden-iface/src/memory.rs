//! In-process interface backend
//!
//! Validates configuration like a mobile VPN builder does, records
//! every accepted call and hands out synthetic descriptors. Used where
//! no OS interface is available (simulation, tests).

use crate::backend::{InterfaceBackend, InterfaceError, PlatformBuilder, RawTunFd};
use crate::cache::PrefixedAddress;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// First synthetic descriptor handed out
const FIRST_FD: RawTunFd = 10;

/// Smallest MTU the backend accepts (IPv4 minimum)
const MIN_MTU: u32 = 68;

/// A call accepted by a [`MemoryBackend`] builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuilderCall {
    /// A fresh builder was created for this session
    Session(String),
    Address(PrefixedAddress),
    Route(PrefixedAddress),
    DnsServer(IpAddr),
    SearchDomain(String),
    Mtu(u32),
    /// The interface was opened with this descriptor
    Establish(RawTunFd),
}

impl BuilderCall {
    /// Check if the call is DNS related
    pub fn is_dns(&self) -> bool {
        matches!(self, BuilderCall::DnsServer(_) | BuilderCall::SearchDomain(_))
    }
}

struct MemoryShared {
    calls: Mutex<Vec<BuilderCall>>,
    next_fd: AtomicI32,
    fail_establish: AtomicBool,
}

impl MemoryShared {
    fn record(&self, call: BuilderCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

/// In-memory interface backend
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<MemoryShared>,
}

impl MemoryBackend {
    /// Create a new backend
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MemoryShared {
                calls: Mutex::new(Vec::new()),
                next_fd: AtomicI32::new(FIRST_FD),
                fail_establish: AtomicBool::new(false),
            }),
        }
    }

    /// Every accepted call so far, across all builders
    pub fn calls(&self) -> Vec<BuilderCall> {
        self.shared
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.shared
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Make subsequent establishments fail (or succeed again)
    pub fn set_fail_establish(&self, fail: bool) {
        self.shared.fail_establish.store(fail, Ordering::Relaxed);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceBackend for MemoryBackend {
    fn new_builder(&self, session: &str) -> Box<dyn PlatformBuilder> {
        self.shared.record(BuilderCall::Session(session.to_string()));
        Box::new(MemoryBuilder {
            session: session.to_string(),
            shared: self.shared.clone(),
            addresses: 0,
        })
    }
}

struct MemoryBuilder {
    session: String,
    shared: Arc<MemoryShared>,
    addresses: usize,
}

fn is_bad_address(addr: IpAddr) -> bool {
    addr.is_unspecified() || addr.is_multicast()
}

impl PlatformBuilder for MemoryBuilder {
    fn add_address(&mut self, address: PrefixedAddress) -> Result<(), InterfaceError> {
        if is_bad_address(address.addr) {
            return Err(InterfaceError::Rejected(format!("bad address {}", address)));
        }
        self.addresses += 1;
        self.shared.record(BuilderCall::Address(address));
        Ok(())
    }

    fn add_route(&mut self, route: PrefixedAddress) -> Result<(), InterfaceError> {
        if route.has_host_bits() {
            return Err(InterfaceError::Rejected(format!("bad route {}", route)));
        }
        self.shared.record(BuilderCall::Route(route));
        Ok(())
    }

    fn add_dns_server(&mut self, server: IpAddr) -> Result<(), InterfaceError> {
        if is_bad_address(server) {
            return Err(InterfaceError::Rejected(format!("bad DNS server {}", server)));
        }
        self.shared.record(BuilderCall::DnsServer(server));
        Ok(())
    }

    fn add_search_domain(&mut self, domain: &str) -> Result<(), InterfaceError> {
        self.shared.record(BuilderCall::SearchDomain(domain.to_string()));
        Ok(())
    }

    fn set_mtu(&mut self, mtu: u32) -> Result<(), InterfaceError> {
        if mtu < MIN_MTU {
            return Err(InterfaceError::InvalidMtu(mtu));
        }
        self.shared.record(BuilderCall::Mtu(mtu));
        Ok(())
    }

    fn establish(&mut self) -> Result<Option<RawTunFd>, InterfaceError> {
        if self.shared.fail_establish.load(Ordering::Relaxed) {
            return Err(InterfaceError::Rejected("establish refused".into()));
        }
        if self.addresses == 0 {
            // No address, no interface
            return Ok(None);
        }

        let fd = self.shared.next_fd.fetch_add(1, Ordering::Relaxed);
        debug!("Session {} established on fd {}", self.session, fd);
        self.shared.record(BuilderCall::Establish(fd));
        Ok(Some(fd))
    }
}
