//! Error types of the task system.

use std::{io, path::PathBuf};

use thiserror::Error;

use super::priority::WorkerThreadType;

/// Errors produced while loading or validating a [`TaskSystemConfig`](super::TaskSystemConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read task system config {path}")]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The configuration is not valid JSON for this schema.
    #[error("failed to parse task system config")]
    Parse(#[from] serde_json::Error),
    /// A worker pool exceeds the supported size.
    #[error("{worker_type} pool has {requested} workers, at most {max} are supported")]
    TooManyWorkers {
        /// The offending pool.
        worker_type: WorkerThreadType,
        /// The configured count.
        requested: usize,
        /// The supported maximum.
        max: usize,
    },
    /// Idle workers would never time out and re-check their queues.
    #[error("idle timeout must be greater than zero")]
    ZeroIdleTimeout,
    /// The frame time is zero, negative or not a number.
    #[error("target frame time must be a positive number of milliseconds, got {0}")]
    InvalidFrameTime(f64),
}

/// Errors produced while starting a [`TaskSystem`](super::TaskSystem).
#[derive(Debug, Error)]
pub enum TaskSystemError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The operating system refused to create a worker thread.
    #[error("failed to spawn {worker_type} worker thread {index}")]
    SpawnWorker {
        /// Pool the thread belonged to.
        worker_type: WorkerThreadType,
        /// Index of the thread within its pool.
        index: usize,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// The expected failure of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    /// At least one invocation was already executing and could not be stopped.
    #[error("task '{name}' was already running and could not be cancelled")]
    TaskStillRunning {
        /// Name of the first task that was running.
        name: String,
    },
}
