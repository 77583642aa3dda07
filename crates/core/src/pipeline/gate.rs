use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Cooperative pause/stop latch awaited between node executions.
///
/// Nothing here interrupts a node in flight; the walk only observes the gate
/// before starting the next node.
pub struct RunGate {
    paused: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl RunGate {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused,
            stopped: AtomicBool::new(false),
        }
    }

    /// Close the gate; returns false if it was already closed
    pub fn pause(&self) -> bool {
        !self.paused.send_replace(true)
    }

    /// Open the gate; returns false if it was not closed
    pub fn resume(&self) -> bool {
        self.paused.send_replace(false)
    }

    /// Request a stop. A pending pause is released so the walk can see it.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Clear both flags before a new run
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.paused.send_replace(false);
    }

    /// Wait until the gate is open. Returns false if a stop was requested.
    pub async fn wait(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.is_stopped() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            if rx.changed().await.is_err() {
                return !self.is_stopped();
            }
        }
    }
}

impl Default for RunGate {
    fn default() -> Self {
        Self::new()
    }
}
