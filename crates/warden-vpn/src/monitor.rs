//! Network change monitor.
//!
//! Receives connectivity updates from the platform on any thread and
//! replays them, one at a time, into the coordinator from a dedicated
//! thread. Bursts are collapsed to the most recent snapshot.

use crate::coordinator::{ConnectionCoordinator, CoordinatorError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use warden_net::{NetworkSnapshot, SharedProbe};

/// Messages to the monitor thread
#[derive(Debug, Clone, Copy)]
pub enum MonitorMessage {
    Changed(NetworkSnapshot),
    Shutdown,
}

/// Forwards network changes to a coordinator
pub struct NetworkMonitor {
    tx: Sender<MonitorMessage>,
    probe: SharedProbe,
    handle: Option<JoinHandle<()>>,
}

impl NetworkMonitor {
    /// Start the monitor thread.
    ///
    /// `probe` should be the same probe the coordinator reads, so a
    /// connect decided after [`notify`](Self::notify) sees the new network.
    pub fn spawn(
        coordinator: Arc<ConnectionCoordinator>,
        probe: SharedProbe,
    ) -> Result<Self, CoordinatorError> {
        let (tx, rx) = unbounded();

        let handle = thread::Builder::new()
            .name("vpn-network-monitor".to_string())
            .spawn(move || {
                info!("Network monitor started");
                run_monitor_loop(&coordinator, rx);
                info!("Network monitor stopped");
            })?;

        Ok(Self {
            tx,
            probe,
            handle: Some(handle),
        })
    }

    /// Report a new network snapshot
    pub fn notify(&self, snapshot: NetworkSnapshot) {
        self.probe.set(snapshot);
        if self.tx.send(MonitorMessage::Changed(snapshot)).is_err() {
            warn!("Network monitor is not running, dropping {:?}", snapshot);
        }
    }

    /// Stop the thread and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(MonitorMessage::Shutdown);
            if handle.join().is_err() {
                warn!("Network monitor thread panicked");
            }
        }
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_monitor_loop(coordinator: &ConnectionCoordinator, rx: Receiver<MonitorMessage>) {
    while let Ok(msg) = rx.recv() {
        let MonitorMessage::Changed(mut snapshot) = msg else {
            debug!("Network monitor received shutdown");
            return;
        };

        for queued in rx.try_iter() {
            match queued {
                MonitorMessage::Changed(newer) => snapshot = newer,
                MonitorMessage::Shutdown => return,
            }
        }

        debug!("Network changed: {:?}", snapshot);
        if let Some(active) = snapshot.active.filter(|active| active.failover) {
            info!("Failed over to {}", active.kind);
        }
        coordinator.handle_network_change(&snapshot);
    }
    debug!("Network monitor channel closed");
}
