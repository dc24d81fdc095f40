//! Worker threads and the per-thread bookkeeping the scheduler consults.
//!
//! Every worker serves the tier ranges of its category. When its queues are empty it marks
//! itself `Idle` under the scheduler lock and sleeps on its wake signal; whoever queues work
//! claims idle workers with an `Idle -> Active` transition before signalling them, so a
//! worker is never woken twice and never misses work queued while it was going to sleep.

use std::{
    cell::RefCell,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::core::{lock, AtomicWorkerState, WakeSignal, WorkerState};

use super::{
    priority::WorkerThreadType,
    task::{SharedTask, TaskNesting},
    Scheduler,
};

/// How busy a worker was during the last measured frame.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ThreadUtilization {
    /// Share of the frame spent executing task bodies, between `0.0` and `1.0`.
    pub busy_fraction: f64,
    /// Invocations the worker executed during the frame, including ones it helped with
    /// while waiting.
    pub tasks_executed: u64,
}

pub(crate) struct WorkerThread {
    pub(crate) worker_type: WorkerThreadType,
    pub(crate) index: usize,
    pub(crate) state: AtomicWorkerState,
    pub(crate) signal: WakeSignal,
    tasks_executed: AtomicU64,

    /// Accumulated since the last utilization update.
    busy_nanos: AtomicU64,
    frame_tasks: AtomicU64,
    utilization: Mutex<ThreadUtilization>,
}

impl WorkerThread {
    pub(crate) fn new(worker_type: WorkerThreadType, index: usize) -> Self {
        Self {
            worker_type,
            index,
            state: AtomicWorkerState::new(WorkerState::Active),
            signal: WakeSignal::new(),
            tasks_executed: AtomicU64::new(0),
            busy_nanos: AtomicU64::new(0),
            frame_tasks: AtomicU64::new(0),
            utilization: Mutex::new(ThreadUtilization::default()),
        }
    }

    /// Accounts one executed invocation that kept this worker busy for `busy`.
    pub(crate) fn record_task(&self, busy: Duration) {
        let nanos = u64::try_from(busy.as_nanos()).unwrap_or(u64::MAX);
        self.busy_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.frame_tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Turns what was recorded since the previous call into the utilization of a frame
    /// that lasted `frame`, which must not be zero.
    pub(crate) fn update_utilization(&self, frame: Duration) {
        let busy = Duration::from_nanos(self.busy_nanos.swap(0, Ordering::Relaxed));
        let tasks_executed = self.frame_tasks.swap(0, Ordering::Relaxed);

        // A task that straddles frames is credited entirely to the frame it ends in.
        let busy_fraction = (busy.as_secs_f64() / frame.as_secs_f64()).clamp(0.0, 1.0);
        *lock(&self.utilization) = ThreadUtilization {
            busy_fraction,
            tasks_executed,
        };
    }

    pub(crate) fn utilization(&self) -> ThreadUtilization {
        *lock(&self.utilization)
    }
}

/// What the current thread is doing for which scheduler.
struct TaskWorkerInfo {
    scheduler_id: u64,
    worker: Option<Arc<WorkerThread>>,
    allow_nested_tasks: bool,
    task_name: Option<String>,
}

impl Default for TaskWorkerInfo {
    fn default() -> Self {
        Self {
            scheduler_id: 0,
            worker: None,
            allow_nested_tasks: true,
            task_name: None,
        }
    }
}

thread_local! {
    static WORKER_INFO: RefCell<TaskWorkerInfo> = RefCell::new(TaskWorkerInfo::default());
}

/// The worker the calling thread is, if it belongs to scheduler `scheduler_id`.
pub(crate) fn current_worker(scheduler_id: u64) -> Option<Arc<WorkerThread>> {
    WORKER_INFO.with(|info| {
        let info = info.borrow();
        if info.scheduler_id == scheduler_id {
            info.worker.clone()
        } else {
            None
        }
    })
}

/// Whether the task running on this thread may wait, and its name if one is running.
pub(crate) fn nesting_state() -> (bool, Option<String>) {
    WORKER_INFO.with(|info| {
        let info = info.borrow();
        (info.allow_nested_tasks, info.task_name.clone())
    })
}

/// Records `task` as running on this thread until the returned guard is dropped.
pub(crate) fn enter_task(task: &SharedTask) -> RunningTaskGuard {
    WORKER_INFO.with(|info| {
        let mut info = info.borrow_mut();
        let previous_allow = std::mem::replace(
            &mut info.allow_nested_tasks,
            task.nesting() != TaskNesting::Never,
        );
        let previous_name = info.task_name.replace(task.name().to_string());

        RunningTaskGuard {
            previous_allow,
            previous_name,
        }
    })
}

/// Restores the outer task's nesting state, also when a task body unwinds.
pub(crate) struct RunningTaskGuard {
    previous_allow: bool,
    previous_name: Option<String>,
}

impl Drop for RunningTaskGuard {
    fn drop(&mut self) {
        let previous_name = self.previous_name.take();
        let previous_allow = self.previous_allow;
        // The thread-local can already be gone while a worker thread is torn down.
        let _ = WORKER_INFO.try_with(|info| {
            let mut info = info.borrow_mut();
            info.allow_nested_tasks = previous_allow;
            info.task_name = previous_name;
        });
    }
}

pub(crate) fn spawn(
    scheduler: &Arc<Scheduler>,
    worker: Arc<WorkerThread>,
) -> io::Result<JoinHandle<()>> {
    let name = format!(
        "{}-{}-{}",
        scheduler.config.thread_name_prefix, worker.worker_type, worker.index
    );
    let scheduler = scheduler.clone();

    thread::Builder::new()
        .name(name)
        .spawn(move || worker_main(scheduler, worker))
}

fn worker_main(scheduler: Arc<Scheduler>, worker: Arc<WorkerThread>) {
    WORKER_INFO.with(|info| {
        *info.borrow_mut() = TaskWorkerInfo {
            scheduler_id: scheduler.id,
            worker: Some(worker.clone()),
            ..TaskWorkerInfo::default()
        };
    });

    log::trace!("{} worker {} running", worker.worker_type, worker.index);

    let ranges = worker.worker_type.priority_ranges();
    let idle_timeout = scheduler.config.idle_timeout();

    while !scheduler.exit.load(Ordering::Acquire) {
        if scheduler.execute_task(ranges, false, None, Some(&worker.state)) {
            worker.tasks_executed.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        // Nothing was found, so `execute_task` left us `Idle`. Either a producer claims us
        // and signals, or we time out and look again on our own.
        worker.signal.wait_timeout(idle_timeout);
        let _ = worker.state.transition(WorkerState::Idle, WorkerState::Active);
    }

    log::trace!(
        "{} worker {} exiting after {} tasks",
        worker.worker_type,
        worker.index,
        worker.tasks_executed.load(Ordering::Relaxed)
    );

    WORKER_INFO.with(|info| *info.borrow_mut() = TaskWorkerInfo::default());
}

impl Scheduler {
    /// Wakes up to `count` idle workers of `worker_type`.
    ///
    /// At most `min(count, idle workers)` threads are woken; busy and blocked workers are
    /// left alone. Types without a pool are ignored.
    pub(crate) fn wake_up_threads(&self, worker_type: WorkerThreadType, count: usize) {
        let Some(pool) = worker_type.pool_index() else {
            return;
        };

        let mut remaining = count;
        for worker in &self.workers[pool] {
            if remaining == 0 {
                break;
            }

            if worker
                .state
                .transition(WorkerState::Idle, WorkerState::Active)
                .is_ok()
            {
                worker.signal.notify();
                self.workers_woken.fetch_add(1, Ordering::Relaxed);
                remaining -= 1;
            }
        }

        log::trace!(
            "Woke {} of {} requested {} workers",
            count - remaining,
            count,
            worker_type
        );
    }
}
