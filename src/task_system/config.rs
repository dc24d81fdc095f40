//! # Task System Configuration
//!
//! Worker pool sizes and pacing parameters. The configuration is plain data that can be
//! built in code or deserialized from JSON; every field is optional in JSON and falls back
//! to [`TaskSystemConfig::default`].
//!
//! ```json
//! {
//!     "short_task_workers": 6,
//!     "long_task_workers": 2,
//!     "file_access_workers": 1,
//!     "target_frame_time_ms": 16.6,
//!     "idle_timeout_ms": 100,
//!     "thread_name_prefix": "engine"
//! }
//! ```

use std::{fs, path::Path, thread, time::Duration};

use serde::Deserialize;

use super::{error::ConfigError, priority::WorkerThreadType};

/// Upper bound for the number of workers in one pool.
pub const MAX_WORKERS_PER_TYPE: usize = 128;

/// Settings for a [`TaskSystem`](super::TaskSystem).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskSystemConfig {
    /// Workers serving the frame-relative tiers.
    pub short_task_workers: usize,
    /// Workers serving the long running tiers.
    pub long_task_workers: usize,
    /// Workers serving the file access tiers.
    pub file_access_workers: usize,
    /// Frame budget used to pace `SomeFrameMainThread` work.
    pub target_frame_time_ms: f64,
    /// How long an idle worker sleeps before re-checking its queues on its own.
    pub idle_timeout_ms: u64,
    /// Prefix of every worker thread name.
    pub thread_name_prefix: String,
}

impl Default for TaskSystemConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(2, |cores| cores.get());

        Self {
            short_task_workers: cores.saturating_sub(1).clamp(2, MAX_WORKERS_PER_TYPE),
            long_task_workers: 2,
            file_access_workers: 1,
            target_frame_time_ms: 16.6,
            idle_timeout_ms: 100,
            thread_name_prefix: "task-system".to_string(),
        }
    }
}

impl TaskSystemConfig {
    /// A configuration without any worker threads.
    ///
    /// All work then progresses only when the main thread pumps or waits, which makes the
    /// order of execution fully deterministic.
    pub fn without_workers() -> Self {
        Self {
            short_task_workers: 0,
            long_task_workers: 0,
            file_access_workers: 0,
            ..Self::default()
        }
    }

    /// Parses a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Checks the configuration for values the task system cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for worker_type in WorkerThreadType::POOLS {
            let requested = self.worker_count(worker_type);
            if requested > MAX_WORKERS_PER_TYPE {
                return Err(ConfigError::TooManyWorkers {
                    worker_type,
                    requested,
                    max: MAX_WORKERS_PER_TYPE,
                });
            }
        }

        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::ZeroIdleTimeout);
        }

        if !self.target_frame_time_ms.is_finite() || self.target_frame_time_ms <= 0.0 {
            return Err(ConfigError::InvalidFrameTime(self.target_frame_time_ms));
        }

        Ok(())
    }

    /// Configured size of the pool serving `worker_type`. Non-pool types have no workers.
    pub fn worker_count(&self, worker_type: WorkerThreadType) -> usize {
        match worker_type {
            WorkerThreadType::ShortTasks => self.short_task_workers,
            WorkerThreadType::LongTasks => self.long_task_workers,
            WorkerThreadType::FileAccess => self.file_access_workers,
            WorkerThreadType::Unknown | WorkerThreadType::MainThread => 0,
        }
    }

    /// [`TaskSystemConfig::target_frame_time_ms`] as a `Duration`.
    pub fn target_frame_time(&self) -> Duration {
        Duration::from_secs_f64(self.target_frame_time_ms / 1000.0)
    }

    /// [`TaskSystemConfig::idle_timeout_ms`] as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
