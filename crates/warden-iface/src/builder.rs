//! Interface Builder
//!
//! Thread-safe front for the platform builder. The tunnel engine calls
//! into it from its own threads while negotiating, so every operation
//! runs under one builder-local lock that is independent of the
//! connection coordinator's lock.
//!
//! # Usage
//!
//! ```rust,ignore
//! let builder = InterfaceBuilder::new("corp", Arc::new(MemoryBackend::new()));
//! builder.add_address("10.0.0.2".parse()?, 32)?;
//! builder.add_route("0.0.0.0".parse()?, 0)?;
//! builder.add_dns_server("10.0.0.1".parse()?)?;
//! let fd = builder.establish()?;
//!
//! // After a rekey, rebuild without DNS
//! let fd = builder.establish_no_dns()?;
//! ```

use crate::backend::{InterfaceBackend, InterfaceError, PlatformBuilder, RawTunFd};
use crate::cache::{InterfaceConfigCache, PrefixedAddress};
use std::mem;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

struct BuilderState {
    /// Platform builder receiving the current configuration
    platform: Box<dyn PlatformBuilder>,
    /// Non-DNS values accepted by `platform` so far
    pending: InterfaceConfigCache,
    /// Snapshot committed by the last successful `establish`
    established: Option<Arc<InterfaceConfigCache>>,
}

/// Single-use interface builder for one tunnel session
pub struct InterfaceBuilder {
    session: String,
    backend: Arc<dyn InterfaceBackend>,
    state: Mutex<BuilderState>,
}

impl InterfaceBuilder {
    /// Create a builder for the given session name
    pub fn new(session: impl Into<String>, backend: Arc<dyn InterfaceBackend>) -> Self {
        let session = session.into();
        let platform = backend.new_builder(&session);

        Self {
            session,
            backend,
            state: Mutex::new(BuilderState {
                platform,
                pending: InterfaceConfigCache::new(),
                established: None,
            }),
        }
    }

    /// Session name shown by the OS
    pub fn session(&self) -> &str {
        &self.session
    }

    fn state(&self) -> MutexGuard<'_, BuilderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an interface address
    pub fn add_address(&self, addr: IpAddr, prefix: u8) -> Result<(), InterfaceError> {
        let address = PrefixedAddress::new(addr, prefix)?;
        let mut state = self.state();
        state.platform.add_address(address).inspect_err(|e| {
            warn!("Address {} rejected: {}", address, e);
        })?;
        state.pending.record_address(address);
        Ok(())
    }

    /// Add a route through the tunnel
    pub fn add_route(&self, addr: IpAddr, prefix: u8) -> Result<(), InterfaceError> {
        let route = PrefixedAddress::new(addr, prefix)?;
        let mut state = self.state();
        state.platform.add_route(route).inspect_err(|e| {
            warn!("Route {} rejected: {}", route, e);
        })?;
        state.pending.record_route(route);
        Ok(())
    }

    /// Add a DNS server (not cached)
    pub fn add_dns_server(&self, server: IpAddr) -> Result<(), InterfaceError> {
        self.state().platform.add_dns_server(server).inspect_err(|e| {
            warn!("DNS server {} rejected: {}", server, e);
        })
    }

    /// Add a DNS search domain (not cached)
    pub fn add_search_domain(&self, domain: &str) -> Result<(), InterfaceError> {
        if domain.trim().is_empty() {
            return Err(InterfaceError::InvalidDomain(domain.to_string()));
        }
        self.state().platform.add_search_domain(domain).inspect_err(|e| {
            warn!("Search domain {} rejected: {}", domain, e);
        })
    }

    /// Set the interface MTU
    pub fn set_mtu(&self, mtu: u32) -> Result<(), InterfaceError> {
        if mtu == 0 {
            return Err(InterfaceError::InvalidMtu(mtu));
        }
        let mut state = self.state();
        state.platform.set_mtu(mtu).inspect_err(|e| {
            warn!("MTU {} rejected: {}", mtu, e);
        })?;
        state.pending.record_mtu(mtu);
        Ok(())
    }

    /// Commit the accumulated configuration and open the interface.
    ///
    /// On success the accumulated non-DNS values become the established
    /// snapshot and a fresh empty platform builder takes over, ready for
    /// the next configuration. On failure nothing changes and the call
    /// can be retried.
    pub fn establish(&self) -> Result<RawTunFd, InterfaceError> {
        let mut state = self.state();

        let fd = match state.platform.establish() {
            Ok(Some(fd)) => fd,
            Ok(None) => {
                warn!("Session {}: platform returned no descriptor", self.session);
                return Err(InterfaceError::NoDescriptor);
            }
            Err(e) => {
                warn!("Session {}: establish failed: {}", self.session, e);
                return Err(e);
            }
        };

        state.platform = self.backend.new_builder(&self.session);
        let committed = mem::take(&mut state.pending);
        info!(
            "Session {} established (fd {}, {} addresses, {} routes)",
            self.session,
            fd,
            committed.addresses().len(),
            committed.routes().len()
        );
        state.established = Some(Arc::new(committed));

        Ok(fd)
    }

    /// Rebuild the interface from the established snapshot, without DNS.
    ///
    /// Fails with [`InterfaceError::NotEstablished`] if no `establish`
    /// has succeeded yet.
    pub fn establish_no_dns(&self) -> Result<RawTunFd, InterfaceError> {
        let state = self.state();

        let Some(cache) = state.established.clone() else {
            warn!("Session {}: nothing established to replay", self.session);
            return Err(InterfaceError::NotEstablished);
        };

        let mut platform = self.backend.new_builder(&self.session);
        cache.apply(platform.as_mut())?;

        match platform.establish()? {
            Some(fd) => {
                debug!("Session {} re-established without DNS (fd {})", self.session, fd);
                Ok(fd)
            }
            None => Err(InterfaceError::NoDescriptor),
        }
    }

    /// Snapshot committed by the last successful `establish`
    pub fn established_config(&self) -> Option<Arc<InterfaceConfigCache>> {
        self.state().established.clone()
    }
}

impl std::fmt::Debug for InterfaceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceBuilder")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
