//! Lock-free worker state tracking.

use std::sync::atomic::{AtomicU8, Ordering};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// What a worker thread is currently doing, as far as wake-up accounting is concerned.
///
/// Only `Idle` workers are considered available capacity. A worker that is waiting
/// on another group from inside a task body is `Blocked`, so it is neither woken
/// nor counted as busy with useful work.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum WorkerState {
    /// Executing a task or looking for one.
    Active = 0,
    /// Parked on its wake signal because the queues it serves were empty.
    Idle = 1,
    /// Waiting inside a task body for other work to finish.
    Blocked = 2,
}

/// A `WorkerState` that can be shared between the worker and the threads waking it.
#[derive(Debug)]
pub struct AtomicWorkerState(AtomicU8);

impl AtomicWorkerState {
    /// Creates a new state cell holding `state`.
    pub fn new(state: WorkerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Returns the current state.
    pub fn load(&self) -> WorkerState {
        Self::decode(self.0.load(Ordering::Acquire))
    }

    /// Stores `state` and returns the state it replaced.
    pub fn swap(&self, state: WorkerState) -> WorkerState {
        Self::decode(self.0.swap(state as u8, Ordering::AcqRel))
    }

    /// Moves from `current` to `new` if the cell still holds `current`.
    ///
    /// # Returns
    /// `Ok` with the previous state on success, `Err` with the actual state otherwise.
    pub fn transition(
        &self,
        current: WorkerState,
        new: WorkerState,
    ) -> Result<WorkerState, WorkerState> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(Self::decode)
            .map_err(Self::decode)
    }

    fn decode(raw: u8) -> WorkerState {
        // Only ever written from a `WorkerState`.
        WorkerState::from_u8(raw).unwrap_or(WorkerState::Active)
    }
}
