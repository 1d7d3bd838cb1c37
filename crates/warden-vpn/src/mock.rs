//! Recording engine for coordinator tests.

use crate::coordinator::StatusReporter;
use crate::engine::{EngineContext, EngineError, TunnelEngine};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use warden_iface::InterfaceBuilder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Initialize { session: String, byod: bool },
    Initiate { tunnel_type: String, gateway: String, username: String },
    Deinitialize,
    NetworkChanged(bool),
}

#[derive(Default)]
struct LogInner {
    calls: Vec<EngineCall>,
    active: bool,
    overlapped: bool,
    reporter: Option<StatusReporter>,
    builder: Option<Arc<InterfaceBuilder>>,
}

/// Shared view of what the engine was asked to do
#[derive(Clone, Default)]
pub struct EngineLog {
    inner: Arc<Mutex<LogInner>>,
}

impl EngineLog {
    fn inner(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.inner().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&EngineCall) -> bool) -> usize {
        self.inner().calls.iter().filter(|c| pred(c)).count()
    }

    /// An initialize happened while a previous session was still up
    pub fn overlapped(&self) -> bool {
        self.inner().overlapped
    }

    pub fn reporter(&self) -> StatusReporter {
        self.inner().reporter.clone().unwrap()
    }

    pub fn builder(&self) -> Option<Arc<InterfaceBuilder>> {
        self.inner().builder.clone()
    }

    /// Poll until the recorded calls satisfy `condition`
    pub fn wait_until(&self, condition: impl Fn(&[EngineCall]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition(&self.inner().calls) {
            assert!(Instant::now() < deadline, "Engine calls: {:?}", self.calls());
            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Blocks the first `initialize` until released
pub struct InitGate {
    entered: Sender<()>,
    release: Receiver<()>,
}

pub struct InitGateControl {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl InitGate {
    pub fn new() -> (Self, InitGateControl) {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        (
            Self {
                entered: entered_tx,
                release: release_rx,
            },
            InitGateControl {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }

    fn pass(self) {
        let _ = self.entered.send(());
        let _ = self.release.recv();
    }
}

impl InitGateControl {
    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(Duration::from_secs(5))
            .expect("engine never reached initialize");
    }

    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

pub struct RecordingEngine {
    log: EngineLog,
    fail_init: bool,
    init_gate: Option<InitGate>,
    status_on_deinit: Option<i32>,
}

impl RecordingEngine {
    pub fn new() -> (Self, EngineLog) {
        let log = EngineLog::default();
        (
            Self {
                log: log.clone(),
                fail_init: false,
                init_gate: None,
                status_on_deinit: None,
            },
            log,
        )
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn with_init_gate(mut self, gate: InitGate) -> Self {
        self.init_gate = Some(gate);
        self
    }

    /// Report `code` from inside `deinitialize`, as a real engine does
    /// when its child SA goes away during teardown
    pub fn with_status_on_deinit(mut self, code: i32) -> Self {
        self.status_on_deinit = Some(code);
        self
    }
}

impl TunnelEngine for RecordingEngine {
    fn initialize(&mut self, ctx: EngineContext) -> Result<(), EngineError> {
        if let Some(gate) = self.init_gate.take() {
            gate.pass();
        }

        let mut log = self.log.inner();
        log.calls.push(EngineCall::Initialize {
            session: ctx.builder.session().to_string(),
            byod: ctx.features.byod,
        });
        if self.fail_init {
            return Err(EngineError::Init("refused by test".into()));
        }
        if log.active {
            log.overlapped = true;
        }
        log.active = true;
        log.reporter = Some(ctx.reporter);
        log.builder = Some(ctx.builder);
        Ok(())
    }

    fn deinitialize(&mut self) {
        let reporter = self.log.inner().reporter.clone();
        if let (Some(code), Some(reporter)) = (self.status_on_deinit, reporter) {
            reporter.report(code);
        }

        let mut log = self.log.inner();
        log.calls.push(EngineCall::Deinitialize);
        log.active = false;
    }

    fn initiate(&mut self, tunnel_type: &str, gateway: &str, username: &str, _password: &str) {
        self.log.inner().calls.push(EngineCall::Initiate {
            tunnel_type: tunnel_type.to_string(),
            gateway: gateway.to_string(),
            username: username.to_string(),
        });
    }

    fn network_changed(&mut self, disconnected: bool) {
        self.log.inner().calls.push(EngineCall::NetworkChanged(disconnected));
    }
}
