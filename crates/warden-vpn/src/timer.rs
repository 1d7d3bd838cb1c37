//! Single-shot connection timeout.

use crossbeam_channel::{after, bounded, select, Sender};
use std::io;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Timer for one connection attempt.
///
/// Runs `on_fire` on its own thread once `duration` elapses, unless the
/// timer is cancelled or dropped first. Cancellation and firing can
/// race, so `on_fire` must re-check that its attempt is still current.
pub struct TimeoutTimer {
    attempt: u64,
    cancel: Option<Sender<()>>,
}

impl TimeoutTimer {
    /// Arm a timer for the given attempt
    pub fn start<F>(attempt: u64, duration: Duration, on_fire: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);

        thread::Builder::new()
            .name(format!("vpn-timeout-{}", attempt))
            .spawn(move || {
                select! {
                    recv(cancel_rx) -> _ => {
                        debug!("Timeout for attempt {} cancelled", attempt);
                    }
                    recv(after(duration)) -> _ => {
                        info!("Timeout for attempt {} fired after {:?}", attempt, duration);
                        on_fire();
                    }
                }
            })?;

        debug!("Timeout for attempt {} armed ({:?})", attempt, duration);
        Ok(Self {
            attempt,
            cancel: Some(cancel_tx),
        })
    }

    /// Attempt this timer belongs to
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Cancel the timer (no-op if it already fired)
    pub fn cancel(mut self) {
        self.disarm();
    }

    fn disarm(&mut self) {
        // Dropping the sender wakes the timer thread
        self.cancel.take();
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
