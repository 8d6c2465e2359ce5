//! Explicit cancellation for the worker threads. Each worker holds a
//! clone of the token and checks it at every wake point, so a stop signal
//! is observed within one sleep interval rather than relying on thread
//! cancellation.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the token and wake every sleeping worker.
    pub fn signal(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.wake.notify_all();
    }

    pub fn is_signalled(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleep for up to `timeout`, waking early on a stop signal. Returns
    /// `true` when the worker should exit.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let mut stopped = self.inner.stopped.lock();
        if *stopped {
            return true;
        }
        self.inner.wake.wait_for(&mut stopped, timeout);
        *stopped
    }
}
