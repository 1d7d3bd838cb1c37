//! Warden Interface - virtual network interface configuration
//!
//! Wraps the OS capability that turns an address/route/DNS/MTU
//! configuration into an open TUN descriptor, and remembers the
//! non-DNS part of the last committed configuration so the interface
//! can be rebuilt after an SA rekey without touching DNS.
//!
//! # Flow
//!
//! ```text
//!  engine thread ──▶ InterfaceBuilder ──▶ PlatformBuilder (OS)
//!                        │                     │
//!                        │ mirror              ▼
//!                        ▼               establish() ──▶ fd
//!                InterfaceConfigCache ──(commit)──▶ established cache
//!                                                        │
//!                        establish_no_dns() ◀── replay ──┘
//! ```

mod backend;
mod builder;
mod cache;
mod memory;

pub use backend::{InterfaceBackend, InterfaceError, PlatformBuilder, RawTunFd, INVALID_FD};
pub use builder::InterfaceBuilder;
pub use cache::{InterfaceConfigCache, PrefixedAddress};
pub use memory::{BuilderCall, MemoryBackend};
