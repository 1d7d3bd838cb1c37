//! Connection Coordinator
//!
//! Serializes profile transitions onto one long-lived worker thread and
//! supervises the tunnel engine.
//!
//! # Usage
//!
//! ```rust,ignore
//! let coordinator = ConnectionCoordinator::new(config, engine, backend, probe)?;
//! let events = coordinator.events();
//!
//! coordinator.request_connect(Profile::new("corp", "vpn.example.com", "alice", "pw"))?;
//! while let Ok(event) = events.recv() {
//!     println!("{:?}", event);
//! }
//!
//! coordinator.request_disconnect(DisconnectReason::User);
//! coordinator.shutdown();
//! ```
//!
//! # Worker loop
//!
//! ```text
//!   wait(profile_updated) ──▶ tear down current ──▶ next?
//!        ▲                                          │
//!        │            None: Disabled ◀──────────────┤
//!        │            network disallowed: error ◀───┤
//!        │                                          ▼
//!        └──────── Connecting ◀── initialize + initiate
//! ```
//!
//! Requests only update the `next` slot and wake the worker, so of
//! several requests made before the worker wakes only the last one
//! runs. All mutable fields sit behind one mutex that is never held
//! across an engine call or a listener. Events published under it are
//! queued and delivered once it is released, so listeners may call any
//! method of the coordinator.

use crate::config::CoordinatorConfig;
use crate::engine::{EngineContext, EngineError, EngineFeatures, EngineStatus, TunnelEngine};
use crate::notifier::{StateListener, StateNotifier, SubscriberId};
use crate::profile::{Profile, ProfileError};
use crate::state::{ConnectionState, DisconnectReason, ErrorState, StatusReport, VpnEvent};
use crate::timer::TimeoutTimer;
use crossbeam_channel::{unbounded, Receiver};
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use warden_iface::{InterfaceBackend, InterfaceBuilder};
use warden_net::{NetworkProbe, NetworkSnapshot, ReachabilityGuard};

/// Coordinator errors
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Invalid profile: {0}")]
    InvalidProfile(#[from] ProfileError),

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Coordinator is shut down")]
    ShutDown,
}

/// Fields guarded by the coordinator lock
struct Slots {
    /// Profile owning the running engine
    current: Option<Profile>,
    /// Profile to run next; `None` means stay disabled
    next: Option<Profile>,
    /// Worker has a request to serve
    profile_updated: bool,
    /// Worker must exit once disabled
    terminate: bool,
    /// Engine teardown in progress (child SA down is expected)
    disconnecting: bool,
    state: ConnectionState,
    error: ErrorState,
    /// Connect request counter, used to discard stale timeouts
    attempt: u64,
}

/// Lock on [`Slots`] that delivers queued events once released
struct SlotsGuard<'a> {
    guard: Option<MutexGuard<'a, Slots>>,
    notifier: &'a StateNotifier,
}

impl Deref for SlotsGuard<'_> {
    type Target = Slots;

    fn deref(&self) -> &Slots {
        self.guard.as_deref().unwrap_or_else(|| unreachable!("guard taken only in drop"))
    }
}

impl DerefMut for SlotsGuard<'_> {
    fn deref_mut(&mut self) -> &mut Slots {
        self.guard.as_deref_mut().unwrap_or_else(|| unreachable!("guard taken only in drop"))
    }
}

impl Drop for SlotsGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.notifier.flush();
    }
}

struct Shared {
    slots: Mutex<Slots>,
    wake: Condvar,
    notifier: StateNotifier,
    engine: Mutex<Box<dyn TunnelEngine>>,
    backend: Arc<dyn InterfaceBackend>,
    probe: Arc<dyn NetworkProbe>,
    guard: ReachabilityGuard,
    config: CoordinatorConfig,
}

impl Shared {
    fn slots(&self) -> SlotsGuard<'_> {
        SlotsGuard {
            guard: Some(self.slots.lock().unwrap_or_else(PoisonError::into_inner)),
            notifier: &self.notifier,
        }
    }

    fn engine(&self) -> MutexGuard<'_, Box<dyn TunnelEngine>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, slots: &mut Slots, state: ConnectionState) {
        if slots.state != state {
            info!("State {} -> {}", slots.state, state);
        }
        slots.state = state;
        self.notifier.publish_state(state);
    }

    fn set_error(&self, slots: &mut Slots, error: ErrorState) {
        if self.notifier.publish_error(error) {
            warn!("Connection error: {}", error);
            slots.error = error;
        }
    }

    fn disconnect_locked(&self, slots: &mut Slots, reason: DisconnectReason) {
        if let Some(error) = reason.error() {
            self.set_error(slots, error);
        }
        self.notifier.cancel_timeout();

        info!("Disconnect requested ({:?})", reason);
        slots.next = None;
        slots.profile_updated = true;
        self.wake.notify_all();
    }

    /// Block until a request arrives. Returns false if the wait was
    /// interrupted: a thread panicked while holding the state lock.
    fn wait_for_update(&self) -> bool {
        let Ok(slots) = self.slots.lock() else {
            return false;
        };
        self.wake
            .wait_while(slots, |slots| !slots.profile_updated)
            .is_ok()
    }

    fn report_status(&self, code: i32) {
        let Some(status) = EngineStatus::from_code(code) else {
            error!("Unknown engine status code {} received", code);
            return;
        };

        let mut slots = self.slots();
        debug!("Engine status {:?}", status);

        match status {
            EngineStatus::ChildSaUp => {
                if slots.disconnecting || slots.current.is_none() {
                    debug!("Ignoring child SA up without a running session");
                } else {
                    self.set_state(&mut slots, ConnectionState::Connected);
                }
            }
            EngineStatus::ChildSaDown => {
                if !slots.disconnecting && slots.current.is_some() {
                    // Engine retries on its own
                    self.set_state(&mut slots, ConnectionState::Connecting);
                }
            }
            _ => {
                if let Some(error) = status.error() {
                    self.set_error(&mut slots, error);
                    if self.config.disconnect_on_error {
                        self.disconnect_locked(&mut slots, DisconnectReason::EngineError);
                    }
                }
            }
        }
    }

    fn on_timeout(&self, attempt: u64) {
        let mut slots = self.slots();
        if slots.attempt != attempt || slots.state.is_connected() {
            debug!("Timeout for attempt {} is stale", attempt);
            return;
        }
        if slots.current.is_none() && slots.next.is_none() {
            debug!("Timeout for attempt {} with nothing pending", attempt);
            return;
        }

        warn!("Connection attempt {} timed out", attempt);
        self.set_error(&mut slots, ErrorState::Timeout);
        self.disconnect_locked(&mut slots, DisconnectReason::Timeout);
    }

    /// Deinitialize the engine if a profile owns it.
    fn stop_current_connection(&self) {
        let profile = {
            let mut slots = self.slots();
            let Some(profile) = slots.current.clone() else {
                return;
            };
            self.set_state(&mut slots, ConnectionState::Disconnecting);
            slots.disconnecting = true;
            profile
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.engine().deinitialize()));
        if result.is_err() {
            error!("Engine panicked while stopping {}", profile);
        }

        self.slots().current = None;
        info!("Engine stopped ({})", profile);
    }

    fn start_connection(self: &Arc<Self>, profile: Profile) {
        let ctx = EngineContext {
            builder: Arc::new(InterfaceBuilder::new(profile.name.clone(), self.backend.clone())),
            log_path: self.config.log_path.clone(),
            features: EngineFeatures {
                byod: self.config.byod || profile.tunnel_type.enable_byod(),
            },
            reporter: StatusReporter {
                shared: Arc::downgrade(self),
            },
        };

        let init = panic::catch_unwind(AssertUnwindSafe(|| self.engine().initialize(ctx)))
            .unwrap_or_else(|_| Err(EngineError::Panicked("initialize".into())));

        if let Err(e) = init {
            error!("Failed to start engine for {}: {}", profile, e);
            let mut slots = self.slots();
            self.set_error(&mut slots, ErrorState::Generic);
            self.notifier.cancel_timeout();
            self.set_state(&mut slots, ConnectionState::Disabled);
            slots.current = None;
            return;
        }

        self.set_state(&mut self.slots(), ConnectionState::Connecting);
        info!(
            "Engine started, initiating {} to {}",
            profile.tunnel_type.identifier(),
            profile.gateway
        );
        if profile.tunnel_type.uses_certificate() {
            debug!("Client certificate: {}", profile.certificate_alias());
        }

        let initiated = panic::catch_unwind(AssertUnwindSafe(|| {
            self.engine().initiate(
                profile.tunnel_type.identifier(),
                &profile.gateway,
                &profile.username,
                &profile.password,
            )
        }));
        if initiated.is_err() {
            error!("Engine panicked while initiating {}", profile);
            let mut slots = self.slots();
            self.set_error(&mut slots, ErrorState::Generic);
            self.disconnect_locked(&mut slots, DisconnectReason::EngineError);
        }
    }
}

fn run_worker_loop(shared: &Arc<Shared>) {
    loop {
        if !shared.wait_for_update() {
            warn!("Coordinator wait interrupted, tearing down");
            shared.slots.clear_poison();
            shared.stop_current_connection();

            let mut slots = shared.slots();
            slots.next = None;
            slots.profile_updated = false;
            shared.set_state(&mut slots, ConnectionState::Disabled);
            if slots.terminate {
                break;
            }
            continue;
        }

        shared.stop_current_connection();

        let network = shared.probe.snapshot();
        let mut slots = shared.slots();
        // Whatever is in `next` now is the latest request
        slots.profile_updated = false;

        let Some(profile) = slots.next.take() else {
            shared.set_state(&mut slots, ConnectionState::Disabled);
            if slots.terminate {
                break;
            }
            continue;
        };

        if !shared.guard.is_usable(&network) {
            warn!(
                "Not starting {}: network disallowed by {:?} policy",
                profile,
                shared.guard.policy()
            );
            shared.set_error(&mut slots, ErrorState::DisallowedNetwork);
            shared.notifier.cancel_timeout();
            shared.set_state(&mut slots, ConnectionState::Disabled);
            continue;
        }

        info!("Starting connection {}", profile);
        slots.current = Some(profile.clone());
        slots.disconnecting = false;
        drop(slots);

        shared.start_connection(profile);
    }
}

/// Handle the engine uses to report status codes.
///
/// Holds only a weak reference; reports arriving after the coordinator
/// is gone are dropped.
#[derive(Clone)]
pub struct StatusReporter {
    shared: Weak<Shared>,
}

impl StatusReporter {
    /// Report a native status code
    pub fn report(&self, code: i32) {
        match self.shared.upgrade() {
            Some(shared) => shared.report_status(code),
            None => debug!("Coordinator gone, dropping engine status {}", code),
        }
    }

    /// Report a decoded status
    pub fn report_status(&self, status: EngineStatus) {
        self.report(status.code());
    }
}

/// Connection lifecycle coordinator
pub struct ConnectionCoordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionCoordinator {
    /// Create a coordinator and start its worker thread
    pub fn new(
        config: CoordinatorConfig,
        engine: Box<dyn TunnelEngine>,
        backend: Arc<dyn InterfaceBackend>,
        probe: Arc<dyn NetworkProbe>,
    ) -> Result<Self, CoordinatorError> {
        info!("Creating connection coordinator (policy: {:?})", config.policy);

        let shared = Arc::new(Shared {
            slots: Mutex::new(Slots {
                current: None,
                next: None,
                profile_updated: false,
                terminate: false,
                disconnecting: false,
                state: ConnectionState::Disabled,
                error: ErrorState::NoError,
                attempt: 0,
            }),
            wake: Condvar::new(),
            notifier: StateNotifier::new(),
            engine: Mutex::new(engine),
            backend,
            probe,
            guard: ReachabilityGuard::new(config.policy),
            config,
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("vpn-coordinator".to_string())
            .spawn(move || {
                info!("Coordinator worker started");
                run_worker_loop(&worker_shared);
                info!("Coordinator worker stopped");
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Ask for a tunnel with this profile, replacing any current one.
    ///
    /// Arms the profile's connection timeout; if `Connected` is not
    /// reached in time the attempt fails with [`ErrorState::Timeout`].
    pub fn request_connect(&self, profile: Profile) -> Result<(), CoordinatorError> {
        profile.validate()?;

        let mut slots = self.shared.slots();
        if slots.terminate {
            return Err(CoordinatorError::ShutDown);
        }

        slots.attempt += 1;
        let attempt = slots.attempt;
        let weak = Arc::downgrade(&self.shared);
        let timer = TimeoutTimer::start(attempt, profile.timeout, move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_timeout(attempt);
            }
        })?;
        self.shared.notifier.begin_attempt(Some(timer));
        slots.error = ErrorState::NoError;

        info!("Connect requested: {} via {}", profile, profile.gateway);
        slots.next = Some(profile);
        slots.profile_updated = true;
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Ask for the tunnel to be torn down
    pub fn request_disconnect(&self, reason: DisconnectReason) {
        let mut slots = self.shared.slots();
        self.shared.disconnect_locked(&mut slots, reason);
    }

    /// The OS revoked VPN permission
    pub fn revoke(&self) {
        self.request_disconnect(DisconnectReason::Revoked);
    }

    /// Tear down, stop the worker and wait for it to exit.
    ///
    /// Idempotent; concurrent callers all return after the worker is gone.
    pub fn shutdown(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = worker.take() else {
            return;
        };

        {
            let mut slots = self.shared.slots();
            info!("Shutting down coordinator");
            slots.terminate = true;
            self.shared.disconnect_locked(&mut slots, DisconnectReason::Shutdown);
        }

        if handle.thread().id() == thread::current().id() {
            warn!("Shutdown requested from the worker thread, not joining");
            *worker = Some(handle);
            return;
        }
        if handle.join().is_err() {
            error!("Coordinator worker panicked");
        }
    }

    /// Entry point for engine status codes
    pub fn report_engine_status(&self, code: i32) {
        self.shared.report_status(code);
    }

    /// Handle for the engine to report status from its own threads
    pub fn reporter(&self) -> StatusReporter {
        StatusReporter {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// React to a change of the device's network.
    ///
    /// Disconnects with [`DisconnectReason::DisallowedNetwork`] when a
    /// tunnel is running or pending on a network the policy forbids, and
    /// tells a running engine whether connectivity is gone.
    pub fn handle_network_change(&self, snapshot: &NetworkSnapshot) {
        let usable = self.shared.guard.is_usable(snapshot);

        let engine_running = {
            let mut slots = self.shared.slots();
            let active = slots.current.is_some() || slots.next.is_some();
            if active && !usable {
                warn!("Moved to a disallowed network, stopping tunnel");
                self.shared
                    .disconnect_locked(&mut slots, DisconnectReason::DisallowedNetwork);
                // Engine is about to be torn down
                false
            } else {
                slots.current.is_some()
            }
        };

        if engine_running {
            let disconnected = snapshot.is_disconnected();
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.shared.engine().network_changed(disconnected)
            }));
            if result.is_err() {
                error!("Engine panicked handling a network change");
            }
        }
    }

    /// Register a listener
    pub fn subscribe(&self, listener: impl StateListener + 'static) -> SubscriberId {
        self.shared.notifier.subscribe(listener)
    }

    /// Remove a listener
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.shared.notifier.unsubscribe(id)
    }

    /// Subscribe a channel and return its receiving end
    pub fn events(&self) -> Receiver<VpnEvent> {
        let (tx, rx) = unbounded();
        self.subscribe(tx);
        rx
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.slots().state
    }

    /// Error of the current or last attempt
    pub fn error_state(&self) -> ErrorState {
        self.shared.slots().error
    }

    /// Profile owning the running engine
    pub fn current_profile(&self) -> Option<Profile> {
        self.shared.slots().current.clone()
    }

    /// Status snapshot for external callers
    pub fn status(&self) -> StatusReport {
        let slots = self.shared.slots();
        StatusReport {
            state: slots.state,
            error: slots.error,
            profile: slots.current.as_ref().map(|p| p.name.clone()),
            up: slots.state.is_connected(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }
}

impl Drop for ConnectionCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{EngineCall, InitGate, RecordingEngine};
    use crate::notifier::FnListener;
    use crate::profile::TunnelType;
    use std::time::{Duration, Instant};
    use warden_iface::MemoryBackend;
    use warden_net::{NetworkKind, SharedProbe};

    const WAIT: Duration = Duration::from_secs(5);

    fn corp() -> Profile {
        Profile::new("corp", "vpn.example.com", "alice", "s3cret")
    }

    fn setup(
        config: CoordinatorConfig,
        engine: RecordingEngine,
        network: NetworkSnapshot,
    ) -> (ConnectionCoordinator, Receiver<VpnEvent>, SharedProbe) {
        let probe = SharedProbe::new(network);
        let coordinator = ConnectionCoordinator::new(
            config,
            Box::new(engine),
            Arc::new(MemoryBackend::new()),
            Arc::new(probe.clone()),
        )
        .unwrap();
        let events = coordinator.events();
        (coordinator, events, probe)
    }

    fn mobile() -> NetworkSnapshot {
        NetworkSnapshot::on(NetworkKind::Mobile)
    }

    /// Collect events up to and including `want`
    fn expect_event(rx: &Receiver<VpnEvent>, want: VpnEvent) -> Vec<VpnEvent> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(event) => {
                    seen.push(event);
                    if event == want {
                        return seen;
                    }
                }
                Err(_) => panic!("Timed out waiting for {:?}, saw {:?}", want, seen),
            }
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "Condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_connect_and_child_sa_bounce() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        coordinator.report_engine_status(EngineStatus::ChildSaUp.code());
        expect_event(&events, VpnEvent::State(ConnectionState::Connected));
        assert_eq!(coordinator.state(), ConnectionState::Connected);

        coordinator.report_engine_status(EngineStatus::ChildSaDown.code());
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));
        assert_eq!(coordinator.state(), ConnectionState::Connecting);

        log.wait_until(|calls| calls.len() >= 2);
        assert_eq!(
            log.calls(),
            vec![
                EngineCall::Initialize {
                    session: "corp".into(),
                    byod: false,
                },
                EngineCall::Initiate {
                    tunnel_type: "ikev2-cert-eap".into(),
                    gateway: "vpn.example.com".into(),
                    username: "alice".into(),
                },
            ]
        );
    }

    #[test]
    fn test_timeout_without_engine_status() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        let profile = corp().with_timeout(Duration::from_millis(200));
        coordinator.request_connect(profile).unwrap();

        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));
        expect_event(&events, VpnEvent::Error(ErrorState::Timeout));
        let tail = expect_event(&events, VpnEvent::State(ConnectionState::Disabled));
        assert!(tail.contains(&VpnEvent::State(ConnectionState::Disconnecting)));

        assert_eq!(coordinator.error_state(), ErrorState::Timeout);
        assert_eq!(coordinator.state(), ConnectionState::Disabled);
        assert_eq!(log.count(|c| matches!(c, EngineCall::Deinitialize)), 1);
    }

    #[test]
    fn test_timeout_after_connected_is_noop() {
        let (engine, _log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator
            .request_connect(corp().with_timeout(Duration::from_millis(150)))
            .unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));
        coordinator.report_engine_status(EngineStatus::ChildSaUp.code());
        expect_event(&events, VpnEvent::State(ConnectionState::Connected));

        thread::sleep(Duration::from_millis(400));

        assert_eq!(coordinator.state(), ConnectionState::Connected);
        assert_eq!(coordinator.error_state(), ErrorState::NoError);
        assert!(events.try_iter().all(|e| !matches!(e, VpnEvent::Error(_))));
    }

    #[test]
    fn test_disallowed_network_never_starts_engine() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(
            CoordinatorConfig::mobile_only(),
            engine,
            NetworkSnapshot::on(NetworkKind::Wifi),
        );

        coordinator.request_connect(corp()).unwrap();
        let seen = expect_event(&events, VpnEvent::State(ConnectionState::Disabled));

        assert_eq!(seen.first(), Some(&VpnEvent::Error(ErrorState::DisallowedNetwork)));
        assert_eq!(coordinator.error_state(), ErrorState::DisallowedNetwork);
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_network_restored_allows_connect() {
        let (engine, _log) = RecordingEngine::new();
        let (coordinator, events, probe) = setup(
            CoordinatorConfig::mobile_only(),
            engine,
            NetworkSnapshot::on(NetworkKind::Wifi),
        );

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Disabled));

        probe.set(mobile());
        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));
        assert_eq!(coordinator.error_state(), ErrorState::NoError);
    }

    #[test]
    fn test_last_request_wins() {
        let (gate, control) = InitGate::new();
        let (engine, log) = RecordingEngine::new();
        let engine = engine.with_init_gate(gate);
        let (coordinator, _events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator
            .request_connect(Profile::new("warmup", "a.example.com", "u", "p"))
            .unwrap();
        // Worker is now stuck inside initialize
        control.wait_entered();

        coordinator
            .request_connect(Profile::new("p", "p.example.com", "u", "p"))
            .unwrap();
        coordinator
            .request_connect(Profile::new("q", "q.example.com", "u", "p"))
            .unwrap();
        control.release();

        log.wait_until(|calls| {
            calls.iter().any(|c| matches!(c, EngineCall::Initiate { gateway, .. } if gateway == "q.example.com"))
        });
        let gateways: Vec<_> = log
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Initiate { gateway, .. } => Some(gateway),
                _ => None,
            })
            .collect();
        assert_eq!(gateways, vec!["a.example.com", "q.example.com"]);
        assert_eq!(coordinator.current_profile().map(|p| p.name), Some("q".to_string()));
    }

    #[test]
    fn test_never_two_tunnels() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, _events, _) = setup(CoordinatorConfig::default(), engine, mobile());
        let coordinator = Arc::new(coordinator);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let coordinator = coordinator.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        if (i + t) % 3 == 0 {
                            coordinator.request_disconnect(DisconnectReason::User);
                        } else {
                            let name = format!("profile-{}-{}", t, i);
                            coordinator
                                .request_connect(Profile::new(name, "vpn.example.com", "u", "p"))
                                .unwrap();
                        }
                        if i % 5 == 0 {
                            coordinator.report_engine_status(EngineStatus::ChildSaUp.code());
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        coordinator.request_disconnect(DisconnectReason::User);
        wait_until(|| {
            let status = coordinator.status();
            status.state == ConnectionState::Disabled && status.profile.is_none()
        });

        assert!(!log.overlapped());
        let inits = log.count(|c| matches!(c, EngineCall::Initialize { .. }));
        let deinits = log.count(|c| matches!(c, EngineCall::Deinitialize));
        assert!(inits >= 1);
        assert_eq!(inits, deinits);
    }

    #[test]
    fn test_shutdown_while_connecting() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        coordinator.shutdown();

        assert_eq!(log.count(|c| matches!(c, EngineCall::Deinitialize)), 1);
        assert_eq!(coordinator.state(), ConnectionState::Disabled);
        assert!(matches!(
            coordinator.request_connect(corp()),
            Err(CoordinatorError::ShutDown)
        ));

        // Idempotent
        coordinator.shutdown();
    }

    #[test]
    fn test_init_failure_disables() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) =
            setup(CoordinatorConfig::default(), engine.failing_init(), mobile());

        coordinator.request_connect(corp()).unwrap();
        let seen = expect_event(&events, VpnEvent::State(ConnectionState::Disabled));

        assert_eq!(seen, vec![
            VpnEvent::Error(ErrorState::Generic),
            VpnEvent::State(ConnectionState::Disabled),
        ]);
        assert_eq!(coordinator.current_profile(), None);
        assert_eq!(log.count(|c| matches!(c, EngineCall::Deinitialize)), 0);
    }

    #[test]
    fn test_engine_error_disconnects() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        coordinator.report_engine_status(EngineStatus::AuthError.code());
        expect_event(&events, VpnEvent::Error(ErrorState::AuthFailed));
        expect_event(&events, VpnEvent::State(ConnectionState::Disabled));

        assert_eq!(coordinator.error_state(), ErrorState::AuthFailed);
        assert_eq!(log.count(|c| matches!(c, EngineCall::Deinitialize)), 1);
    }

    #[test]
    fn test_engine_error_without_auto_disconnect() {
        let config = CoordinatorConfig {
            disconnect_on_error: false,
            ..CoordinatorConfig::default()
        };
        let (engine, _log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(config, engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        coordinator.report_engine_status(EngineStatus::UnreachableError.code());
        coordinator.report_engine_status(EngineStatus::PeerAuthError.code());
        expect_event(&events, VpnEvent::Error(ErrorState::Unreachable));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(coordinator.state(), ConnectionState::Connecting);
        assert_eq!(coordinator.error_state(), ErrorState::Unreachable);
        assert!(events.try_iter().next().is_none());
    }

    #[test]
    fn test_child_sa_down_during_teardown_ignored() {
        let (engine, _log) = RecordingEngine::new();
        let engine = engine.with_status_on_deinit(EngineStatus::ChildSaDown.code());
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));
        coordinator.report_engine_status(EngineStatus::ChildSaUp.code());
        expect_event(&events, VpnEvent::State(ConnectionState::Connected));

        coordinator.request_disconnect(DisconnectReason::User);
        let seen = expect_event(&events, VpnEvent::State(ConnectionState::Disabled));

        assert_eq!(seen, vec![
            VpnEvent::State(ConnectionState::Disconnecting),
            VpnEvent::State(ConnectionState::Disabled),
        ]);
    }

    #[test]
    fn test_disallowed_disconnect_reason_publishes_error() {
        let (engine, _log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        coordinator.request_disconnect(DisconnectReason::DisallowedNetwork);
        expect_event(&events, VpnEvent::Error(ErrorState::DisallowedNetwork));
        expect_event(&events, VpnEvent::State(ConnectionState::Disabled));
    }

    #[test]
    fn test_revoke_disables_without_error() {
        let (engine, _log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        coordinator.revoke();
        let seen = expect_event(&events, VpnEvent::State(ConnectionState::Disabled));
        assert!(seen.iter().all(|e| !matches!(e, VpnEvent::Error(_))));
        assert_eq!(coordinator.error_state(), ErrorState::NoError);
    }

    #[test]
    fn test_unknown_status_ignored() {
        let (engine, _log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        coordinator.report_engine_status(99);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(coordinator.state(), ConnectionState::Connecting);
        assert!(events.try_iter().next().is_none());
    }

    #[test]
    fn test_status_and_features() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        let profile = corp().with_tunnel_type(TunnelType::Ikev2ByodEap);
        coordinator.request_connect(profile).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        let status = coordinator.status();
        assert_eq!(status.profile.as_deref(), Some("corp"));
        assert!(!status.up);

        log.reporter().report_status(EngineStatus::ChildSaUp);
        expect_event(&events, VpnEvent::State(ConnectionState::Connected));
        assert!(coordinator.status().up);

        assert_eq!(log.calls()[0], EngineCall::Initialize {
            session: "corp".into(),
            byod: true,
        });
    }

    #[test]
    fn test_engine_builder_scoped_to_profile() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        let builder = log.builder().unwrap();
        assert_eq!(builder.session(), "corp");
        builder.add_address("10.0.0.2".parse().unwrap(), 32).unwrap();
        assert!(builder.establish().is_ok());
        assert!(builder.establish_no_dns().is_ok());
    }

    #[test]
    fn test_network_change_to_disallowed() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::mobile_only(), engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        coordinator.handle_network_change(&NetworkSnapshot::on(NetworkKind::Wifi));
        expect_event(&events, VpnEvent::Error(ErrorState::DisallowedNetwork));
        expect_event(&events, VpnEvent::State(ConnectionState::Disabled));

        // The session being torn down is not told about the new network
        assert_eq!(log.count(|c| matches!(c, EngineCall::NetworkChanged(_))), 0);
        assert_eq!(log.count(|c| matches!(c, EngineCall::Deinitialize)), 1);
    }

    #[test]
    fn test_network_change_forwarded_to_engine() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        // Nothing running: not forwarded
        coordinator.handle_network_change(&NetworkSnapshot::default());
        assert!(log.calls().is_empty());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        coordinator.handle_network_change(&NetworkSnapshot::default());
        assert!(log.calls().contains(&EngineCall::NetworkChanged(true)));
        assert_eq!(coordinator.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, _events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        let result = coordinator.request_connect(Profile::new("corp", "vpn.example.com", "", "pw"));
        assert!(matches!(
            result,
            Err(CoordinatorError::InvalidProfile(ProfileError::MissingField("username")))
        ));
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_child_sa_status_without_session_ignored() {
        let (engine, _log) = RecordingEngine::new();
        let (coordinator, events, _) =
            setup(CoordinatorConfig::default(), engine.failing_init(), mobile());

        coordinator.report_engine_status(EngineStatus::ChildSaDown.code());
        coordinator.report_engine_status(EngineStatus::ChildSaUp.code());
        assert_eq!(coordinator.state(), ConnectionState::Disabled);

        coordinator.request_connect(corp()).unwrap();
        let seen = expect_event(&events, VpnEvent::State(ConnectionState::Disabled));
        assert!(!seen.contains(&VpnEvent::State(ConnectionState::Connecting)));

        // Late report from the session that never came up
        coordinator.report_engine_status(EngineStatus::ChildSaDown.code());
        assert_eq!(coordinator.state(), ConnectionState::Disabled);
        assert!(events.try_iter().next().is_none());
    }

    #[test]
    fn test_listener_can_read_state() {
        let (engine, _log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());
        let coordinator = Arc::new(coordinator);

        let (tx, observed) = unbounded();
        let weak = Arc::downgrade(&coordinator);
        coordinator.subscribe(FnListener(move |event: VpnEvent| {
            if let Some(c) = weak.upgrade() {
                let _ = tx.send((event, c.state(), c.status().state));
            }
        }));

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        let (event, state, _) = observed.recv_timeout(WAIT).expect("listener blocked");
        assert_eq!(event, VpnEvent::State(ConnectionState::Connecting));
        assert_eq!(state, ConnectionState::Connecting);

        coordinator.shutdown();
    }

    #[test]
    fn test_listener_can_disconnect() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());
        let coordinator = Arc::new(coordinator);

        let weak = Arc::downgrade(&coordinator);
        coordinator.subscribe(FnListener(move |event: VpnEvent| {
            if event == VpnEvent::State(ConnectionState::Connected) {
                if let Some(c) = weak.upgrade() {
                    c.request_disconnect(DisconnectReason::User);
                }
            }
        }));

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));
        coordinator.report_engine_status(EngineStatus::ChildSaUp.code());

        let seen = expect_event(&events, VpnEvent::State(ConnectionState::Disabled));
        assert_eq!(seen, vec![
            VpnEvent::State(ConnectionState::Connected),
            VpnEvent::State(ConnectionState::Disconnecting),
            VpnEvent::State(ConnectionState::Disabled),
        ]);
        assert_eq!(log.count(|c| matches!(c, EngineCall::Deinitialize)), 1);

        coordinator.shutdown();
    }

    #[test]
    fn test_interrupted_wait_tears_down() {
        let (engine, log) = RecordingEngine::new();
        let (coordinator, events, _) = setup(CoordinatorConfig::default(), engine, mobile());

        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));

        // A thread dying with the state lock held poisons it
        let holder = thread::scope(|s| {
            s.spawn(|| {
                let _slots = coordinator.shared.slots.lock();
                panic!("state holder died");
            })
            .join()
        });
        assert!(holder.is_err());
        coordinator.shared.wake.notify_all();

        expect_event(&events, VpnEvent::State(ConnectionState::Disconnecting));
        expect_event(&events, VpnEvent::State(ConnectionState::Disabled));
        assert_eq!(log.count(|c| matches!(c, EngineCall::Deinitialize)), 1);
        assert_eq!(coordinator.current_profile(), None);

        // Worker keeps serving requests afterwards
        coordinator.request_connect(corp()).unwrap();
        expect_event(&events, VpnEvent::State(ConnectionState::Connecting));
    }
}
