use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// The shared run state every loop polls.
///
/// Loops sleep on the shutdown channel rather than plain `thread::sleep`, so dropping the
/// sender wakes all of them at once.
pub(crate) struct Control {
    running: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl Control {
    pub fn new() -> Control {
        let (tx, rx) = bounded(0);
        Control {
            running: AtomicBool::new(true),
            shutdown_tx: Mutex::new(Some(tx)),
            shutdown_rx: rx,
        }
    }

    pub fn is_running(&self) -> bool { self.running.load(Ordering::Acquire) }

    /// Clears the run flag and wakes every sleeping loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown_tx.lock().take();
    }

    /// Sleeps for up to `duration`.  Returns `false` if shutdown was requested meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        if !self.is_running() {
            return false;
        }

        match self.shutdown_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.is_running(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// Handle for asking a running aggregator to stop.
///
/// `Controller` is cloneable; any clone can request shutdown, which every loop notices
/// within one tick.
#[derive(Clone)]
pub struct Controller {
    control: Arc<Control>,
}

impl Controller {
    pub(crate) fn new(control: Arc<Control>) -> Controller { Controller { control } }

    /// Whether the pipeline is still meant to be running.
    pub fn is_running(&self) -> bool { self.control.is_running() }

    /// Requests an orderly shutdown.  Threads are joined by `Running::shutdown`.
    pub fn shutdown(&self) { self.control.stop() }
}
