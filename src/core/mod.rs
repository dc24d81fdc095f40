//! # Core Module
//!
//! This module provides the low-level concurrency primitives the task system is built on.
//! None of them know anything about tasks or groups; they exist so the scheduler code can
//! talk about workers and signals instead of raw atomics and condition variables.
//!
//! ## Key Components
//! - `AtomicWorkerState`: Lock-free `Active`/`Idle`/`Blocked` state of one worker thread
//! - `WakeSignal`: Sticky wake-up flag a parked worker sleeps on
//! - `lock`: Mutex acquisition that survives poisoning
//!
//! ## Usage
//! ```rust
//! use task_system::core::{AtomicWorkerState, WakeSignal, WorkerState};
//!
//! let state = AtomicWorkerState::new(WorkerState::Idle);
//! let signal = WakeSignal::new();
//!
//! // The waking side claims the idle worker before signalling it.
//! if state.transition(WorkerState::Idle, WorkerState::Active).is_ok() {
//!     signal.notify();
//! }
//! ```

pub mod wake_signal;
pub mod worker_state;

pub use wake_signal::WakeSignal;
pub use worker_state::{AtomicWorkerState, WorkerState};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// No lock in this crate is held across a call into a task body.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
