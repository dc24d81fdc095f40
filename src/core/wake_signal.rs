//! Per-worker wake-up signalling.

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use super::lock;

/// A sticky, auto-resetting wake-up flag.
///
/// `notify` sets the flag and wakes the waiter. If nobody is waiting yet the flag stays
/// set, so the next `wait_timeout` returns immediately instead of missing the signal.
///
/// # Examples
/// ```
/// use std::time::Duration;
/// use task_system::core::WakeSignal;
///
/// let signal = WakeSignal::new();
/// signal.notify();
/// assert!(signal.wait_timeout(Duration::from_secs(1)));
/// assert!(!signal.wait_timeout(Duration::from_millis(1)));
/// ```
#[derive(Debug, Default)]
pub struct WakeSignal {
    raised: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    /// Creates a signal in the lowered state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal and wakes one waiter.
    pub fn notify(&self) {
        *lock(&self.raised) = true;
        self.condvar.notify_one();
    }

    /// Blocks until the signal is raised or `timeout` elapses, then lowers it.
    ///
    /// # Returns
    /// `true` if the signal was raised, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.raised);
        let (mut raised, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        std::mem::replace(&mut *raised, false)
    }
}
