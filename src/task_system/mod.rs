//! # Task System
//!
//! This module provides a cooperative task scheduler for executing groups of work across
//! categorized worker thread pools, with dependencies between groups.
//!
//! ## Architecture Overview
//!
//! The task system consists of several key components:
//! - `Scheduler`: The context object owning the group arena, the per-priority ready queues
//!   and the worker pools. All operations are methods on it
//! - `TaskSystem`: Owns a `Scheduler` and its worker threads; stops them when dropped
//! - `SharedTask`: A named, cancellable unit of work with a multiplicity
//! - `TaskGroupId`: Generation-tagged handle to a group of tasks
//! - `TaskPriority`: The tier a group is scheduled in, which picks the worker pool
//!
//! ## Group Lifecycle
//! 1. `create_task_group` takes a free arena slot and returns its handle
//! 2. `add_task_to_group` and `add_task_group_dependency` compose the group
//! 3. `start_task_group` either queues the tasks right away or, if dependencies are still
//!    running, registers the group with them and leaves it dormant
//! 4. Workers (and waiting threads that help out) execute the queued invocations
//! 5. The last invocation finishes the group: its handles go stale, dormant dependents
//!    are queued at the front of their tier, and the completion callback runs
//!
//! ## Locking
//! One global mutex guards the arena, dependency lists and queues. The per-group remaining
//! task count and active dependency count are atomics so finishing a task only takes the
//! lock when it finishes the whole group.
//!
//! ## Example Usage
//! ```rust
//! use task_system::{SharedTask, TaskContext, TaskPriority, TaskSystem, TaskSystemConfig};
//!
//! let system = TaskSystem::new(TaskSystemConfig::default()).unwrap();
//!
//! let load = system.create_task_group(TaskPriority::FileAccess, None);
//! system.add_task_to_group(&load, SharedTask::from_fn("load", |_: &TaskContext<'_>| {}));
//!
//! let build = system.create_task_group(TaskPriority::ThisFrame, None);
//! system.add_task_to_group(&build, SharedTask::from_fn("build", |_: &TaskContext<'_>| {}));
//! system.add_task_group_dependency(&build, &load);
//!
//! system.start_task_group(&build);
//! system.start_task_group(&load);
//! system.wait_for_group(&build);
//! assert!(system.is_task_group_finished(&load));
//! ```

pub mod config;
pub mod error;
mod frame;
pub mod group;
mod groups;
pub mod priority;
pub mod task;
mod tasks;
mod workers;

pub use config::TaskSystemConfig;
pub use error::{CancelError, ConfigError, TaskSystemError};
pub use group::{OnTaskGroupFinished, TaskGroupDependency, TaskGroupId};
pub use priority::{TaskPriority, WorkerThreadType};
pub use task::{OnTaskFinished, SharedTask, Task, TaskContext, TaskNesting};
pub use workers::ThreadUtilization;

use std::{
    collections::VecDeque,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle, ThreadId},
};

use crate::core::{lock, WorkerState};
use frame::FramePacing;
use group::{GroupData, ScheduledTask};
use workers::WorkerThread;

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

/// What a cancellation request does about invocations that are already executing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OnTaskRunning {
    /// Report the running task as not cancelled and return immediately.
    ReturnWithoutBlocking,
    /// Block until the running invocations have completed.
    WaitTillFinished,
}

/// Counters describing what the scheduler has done so far.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Task invocations executed, by workers and helping threads alike.
    pub tasks_executed: u64,
    /// Idle workers that were woken because work arrived.
    pub workers_woken: u64,
}

/// Everything guarded by the scheduler lock.
pub(crate) struct SchedulerState {
    pub(crate) groups: Vec<GroupData>,
    pub(crate) queues: [VecDeque<ScheduledTask>; TaskPriority::COUNT],
    pub(crate) frame_pacing: FramePacing,
}

/// The task scheduler context.
///
/// A `Scheduler` is created by [`TaskSystem::new`] and reached through it; tasks that need
/// to create or wait for work from inside their body hold an `Arc<Scheduler>` obtained from
/// [`TaskSystem::scheduler`]. Several schedulers can coexist in one process.
pub struct Scheduler {
    id: u64,
    state: Mutex<SchedulerState>,
    workers: [Vec<Arc<WorkerThread>>; 3],
    main_thread: ThreadId,
    exit: AtomicBool,
    config: TaskSystemConfig,

    /// Bumped whenever an invocation finishes, for threads blocked in `wait_for_condition`.
    progress: Mutex<u64>,
    progress_changed: Condvar,
    condition_waiters: AtomicUsize,

    tasks_executed: AtomicU64,
    workers_woken: AtomicU64,
}

impl Scheduler {
    fn new(config: TaskSystemConfig) -> Self {
        let id = NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed);
        let workers = WorkerThreadType::POOLS.map(|worker_type| {
            (0..config.worker_count(worker_type))
                .map(|index| Arc::new(WorkerThread::new(worker_type, index)))
                .collect()
        });

        Self {
            id,
            state: Mutex::new(SchedulerState {
                groups: Vec::new(),
                queues: std::array::from_fn(|_| VecDeque::new()),
                frame_pacing: FramePacing::default(),
            }),
            workers,
            main_thread: thread::current().id(),
            exit: AtomicBool::new(false),
            config,
            progress: Mutex::new(0),
            progress_changed: Condvar::new(),
            condition_waiters: AtomicUsize::new(0),
            tasks_executed: AtomicU64::new(0),
            workers_woken: AtomicU64::new(0),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        lock(&self.state)
    }

    /// The configuration this scheduler was started with.
    pub fn config(&self) -> &TaskSystemConfig {
        &self.config
    }

    /// `true` if called from the thread that created the task system.
    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    /// The role of the calling thread for this scheduler.
    pub fn current_worker_type(&self) -> WorkerThreadType {
        if let Some(worker) = workers::current_worker(self.id) {
            worker.worker_type
        } else if self.is_main_thread() {
            WorkerThreadType::MainThread
        } else {
            WorkerThreadType::Unknown
        }
    }

    /// Number of queued, not yet started invocations in the `priority` tier.
    pub fn queued_task_count(&self, priority: TaskPriority) -> usize {
        self.lock_state().queues[priority.index()].len()
    }

    /// Size of the pool serving `worker_type`.
    pub fn worker_count(&self, worker_type: WorkerThreadType) -> usize {
        worker_type
            .pool_index()
            .map_or(0, |pool| self.workers[pool].len())
    }

    /// Number of workers of `worker_type` currently parked for lack of work.
    pub fn idle_worker_count(&self, worker_type: WorkerThreadType) -> usize {
        worker_type.pool_index().map_or(0, |pool| {
            self.workers[pool]
                .iter()
                .filter(|worker| worker.state.load() == WorkerState::Idle)
                .count()
        })
    }

    /// A snapshot of the scheduler's counters.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            workers_woken: self.workers_woken.load(Ordering::Relaxed),
        }
    }

    /// How busy worker `index` of `worker_type` was during the last frame.
    ///
    /// Updated by [`Scheduler::finish_frame_tasks`], so it stays at its default until two
    /// frames have been finished.
    ///
    /// # Returns
    /// `None` if the pool has no worker with that index.
    pub fn thread_utilization(
        &self,
        worker_type: WorkerThreadType,
        index: usize,
    ) -> Option<ThreadUtilization> {
        let pool = worker_type.pool_index()?;
        self.workers[pool].get(index).map(|worker| worker.utilization())
    }

    /// Wakes threads blocked in `wait_for_condition`, if there are any.
    fn notify_progress(&self) {
        if self.condition_waiters.load(Ordering::Acquire) == 0 {
            return;
        }

        *lock(&self.progress) += 1;
        self.progress_changed.notify_all();
    }
}

/// Owner of a [`Scheduler`] and its worker threads.
///
/// Dereferences to the scheduler, so every scheduling operation can be called on it
/// directly. Dropping it stops the workers; work still queued at that point is discarded.
pub struct TaskSystem {
    scheduler: Arc<Scheduler>,
    threads: Vec<JoinHandle<()>>,
}

impl TaskSystem {
    /// Validates `config`, creates a scheduler and spawns its worker pools.
    ///
    /// The calling thread becomes the scheduler's main thread.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a thread could not be spawned.
    /// Workers spawned before the failure are stopped again.
    pub fn new(config: TaskSystemConfig) -> Result<Self, TaskSystemError> {
        config.validate()?;

        let scheduler = Arc::new(Scheduler::new(config));
        let mut system = TaskSystem {
            scheduler: scheduler.clone(),
            threads: Vec::new(),
        };

        for worker in scheduler.workers.iter().flatten() {
            let handle = workers::spawn(&scheduler, worker.clone()).map_err(|source| {
                TaskSystemError::SpawnWorker {
                    worker_type: worker.worker_type,
                    index: worker.index,
                    source,
                }
            })?;
            system.threads.push(handle);
        }

        log::info!(
            "Task system started with {} short, {} long and {} file access workers",
            scheduler.worker_count(WorkerThreadType::ShortTasks),
            scheduler.worker_count(WorkerThreadType::LongTasks),
            scheduler.worker_count(WorkerThreadType::FileAccess),
        );

        Ok(system)
    }

    /// A shared handle to the scheduler, for tasks that submit or wait themselves.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Stops and joins all worker threads.
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        self.scheduler.exit.store(true, Ordering::Release);
        for worker in self.scheduler.workers.iter().flatten() {
            worker.signal.notify();
        }

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("A task system worker thread panicked");
            }
        }

        log::info!("Task system workers stopped");
    }
}

impl Deref for TaskSystem {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
