//! Simulated IKEv2 engine.
//!
//! Stands in for the native charon daemon: negotiates nothing, but
//! drives the interface builder and reports status codes the way the
//! real engine does, including a periodic child SA rekey.

use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use std::net::{IpAddr, Ipv4Addr};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_iface::{InterfaceBuilder, InterfaceError, INVALID_FD};
use warden_vpn::{EngineContext, EngineError, EngineStatus, StatusReporter, TunnelEngine};

/// Gateways under this TLD fail name resolution
const UNRESOLVABLE_SUFFIX: &str = ".invalid";

#[derive(Debug, Clone, Copy)]
pub struct SimTiming {
    pub negotiate: Duration,
    pub rekey: Duration,
}

impl Default for SimTiming {
    fn default() -> Self {
        Self {
            negotiate: Duration::from_millis(500),
            rekey: Duration::from_secs(10),
        }
    }
}

struct Session {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct SimulatedEngine {
    timing: SimTiming,
    ctx: Option<EngineContext>,
    session: Option<Session>,
}

impl SimulatedEngine {
    pub fn new(timing: SimTiming) -> Self {
        Self {
            timing,
            ctx: None,
            session: None,
        }
    }
}

impl TunnelEngine for SimulatedEngine {
    fn initialize(&mut self, ctx: EngineContext) -> Result<(), EngineError> {
        info!(
            "Engine initializing session '{}' (log: {}, byod: {})",
            ctx.builder.session(),
            ctx.log_path.display(),
            ctx.features.byod
        );
        self.ctx = Some(ctx);
        Ok(())
    }

    fn deinitialize(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session.stop);
            if session.handle.join().is_err() {
                warn!("Engine session thread panicked");
            }
        }
        if let Some(ctx) = self.ctx.take() {
            // The child SA goes away with the session
            ctx.reporter.report_status(EngineStatus::ChildSaDown);
            info!("Engine session '{}' closed", ctx.builder.session());
        }
    }

    fn initiate(&mut self, tunnel_type: &str, gateway: &str, username: &str, _password: &str) {
        let Some(ctx) = &self.ctx else {
            warn!("initiate called without initialize");
            return;
        };
        info!("Initiating {} to {} as {}", tunnel_type, gateway, username);

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let builder = ctx.builder.clone();
        let reporter = ctx.reporter.clone();
        let timing = self.timing;
        let unresolvable = gateway.ends_with(UNRESOLVABLE_SUFFIX);

        let spawned = thread::Builder::new()
            .name("sim-ike".to_string())
            .spawn(move || run_session(&builder, &reporter, timing, unresolvable, stop_rx));

        match spawned {
            Ok(handle) => {
                self.session = Some(Session {
                    stop: stop_tx,
                    handle,
                })
            }
            Err(e) => {
                warn!("Failed to spawn engine session: {}", e);
                ctx.reporter.report_status(EngineStatus::GenericError);
            }
        }
    }

    fn network_changed(&mut self, disconnected: bool) {
        if disconnected {
            info!("Engine: connectivity lost, waiting for network");
        } else {
            info!("Engine: network changed, re-establishing path");
        }
    }
}

/// Sleep unless stopped; returns false if stopped
fn wait(stop: &Receiver<()>, duration: Duration) -> bool {
    select! {
        recv(stop) -> _ => false,
        recv(after(duration)) -> _ => true,
    }
}

fn run_session(
    builder: &InterfaceBuilder,
    reporter: &StatusReporter,
    timing: SimTiming,
    unresolvable: bool,
    stop: Receiver<()>,
) {
    if !wait(&stop, timing.negotiate) {
        return;
    }
    if unresolvable {
        reporter.report_status(EngineStatus::LookupError);
        return;
    }

    match configure(builder).and_then(|()| builder.establish()) {
        Ok(fd) => {
            info!("Tunnel interface established (fd {})", fd);
            reporter.report_status(EngineStatus::ChildSaUp);
        }
        Err(e) => {
            warn!("Failed to establish tunnel interface: {}", e);
            reporter.report_status(EngineStatus::GenericError);
            return;
        }
    }

    while wait(&stop, timing.rekey) {
        debug!("Rekeying child SA");
        reporter.report_status(EngineStatus::ChildSaDown);
        // Native side only sees a descriptor, -1 on failure
        let fd = builder
            .establish_no_dns()
            .inspect_err(|e| warn!("Failed to rebuild interface after rekey: {}", e))
            .unwrap_or(INVALID_FD);
        if fd == INVALID_FD {
            reporter.report_status(EngineStatus::GenericError);
            return;
        }
        debug!("Interface rebuilt after rekey (fd {})", fd);
        reporter.report_status(EngineStatus::ChildSaUp);
    }
}

fn configure(builder: &InterfaceBuilder) -> Result<(), InterfaceError> {
    builder.add_address(IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)), 32)?;
    builder.add_route(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)?;
    builder.add_dns_server(IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1)))?;
    builder.add_search_domain("corp.internal")?;
    builder.set_mtu(1400)
}
