//! # Tasks
//!
//! This module defines the unit of work the scheduler moves around.
//!
//! ## Core Components
//! - `Task`: The capability a piece of work provides: execute it, and be told about cancellation
//! - `SharedTask`: Shared-ownership wrapper holding the task's name, multiplicity and the
//!   bookkeeping the scheduler keeps about it
//! - `TaskContext`: What a running task body can see about the current invocation
//!
//! ## Task Lifecycle
//! 1. Application code creates a `SharedTask` and keeps a clone of it
//! 2. The task is added to a group, which resets its bookkeeping
//! 3. Starting the group queues one entry per invocation (`max(1, multiplicity)`)
//! 4. Workers run the invocations; the last one marks the task finished
//! 5. A finished task may be added to a new group and runs again with identical behavior

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use crate::core::lock;

use super::group::TaskGroupId;

/// A piece of work the task system can execute.
///
/// The set of task kinds is open: anything `Send + Sync` can be a task, and closures taking
/// a `&TaskContext` implement this trait directly.
///
/// # Implementation Guidelines
/// - `execute` may be called concurrently for different invocations of the same task when
///   its multiplicity is greater than one
/// - Long running bodies should poll [`TaskContext::is_cancelled`] and return early
pub trait Task: Send + Sync + 'static {
    /// Runs one invocation of the task.
    fn execute(&self, ctx: &TaskContext<'_>);

    /// Called once when somebody requests cancellation, before any queued invocations are
    /// removed. Running invocations are never interrupted; this is only a hint.
    fn on_cancel_requested(&self) {}
}

impl<F> Task for F
where
    F: Fn(&TaskContext<'_>) + Send + Sync + 'static,
{
    fn execute(&self, ctx: &TaskContext<'_>) {
        self(ctx)
    }
}

/// Whether a task may block on other work while it runs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskNesting {
    /// The task may wait for other groups or conditions.
    #[default]
    Maybe,
    /// The task never waits. Waiting from it is a programming error, and such tasks are
    /// safe for waiting threads to pick up while they help out.
    Never,
}

/// Information about the invocation that is currently executing.
pub struct TaskContext<'a> {
    invocation: u32,
    name: &'a str,
    cancel_requested: &'a AtomicBool,
}

impl TaskContext<'_> {
    /// Which of the task's invocations this is, in `0..max(1, multiplicity)`.
    pub fn invocation(&self) -> u32 {
        self.invocation
    }

    /// The task's diagnostic name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// `true` once cancellation of the task has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }
}

/// Callback invoked when the final invocation of a task has finished.
pub type OnTaskFinished = Arc<dyn Fn(&SharedTask) + Send + Sync>;

/// A task together with the state the scheduler tracks for it.
///
/// Cloning is cheap and yields another handle to the same task. The scheduler only holds
/// clones while the task belongs to a group that has not finished yet.
///
/// # Examples
/// ```
/// use task_system::{SharedTask, TaskContext};
///
/// let task = SharedTask::from_fn("sum rows", |ctx: &TaskContext<'_>| {
///     let _row = ctx.invocation();
/// })
/// .with_multiplicity(8);
///
/// assert_eq!(task.multiplicity(), 8);
/// assert!(task.is_finished());
/// ```
#[derive(Clone)]
pub struct SharedTask {
    inner: Arc<TaskCell>,
}

struct TaskCell {
    name: String,
    multiplicity: AtomicU32,
    never_nests: AtomicBool,
    on_finished: Mutex<Option<OnTaskFinished>>,
    state: TaskState,
    body: Box<dyn Task>,
}

/// Scheduler bookkeeping. A task with no remaining runs is finished.
struct TaskState {
    remaining_runs: AtomicU32,
    scheduled: AtomicBool,
    cancel_requested: AtomicBool,
    group: Mutex<Option<TaskGroupId>>,
}

impl SharedTask {
    /// Wraps `body` in a new, finished task named `name`.
    ///
    /// # Arguments
    /// * `name` - Diagnostic name; must not be empty by the time the task is added to a group
    /// * `body` - The work to perform
    pub fn new(name: impl Into<String>, body: impl Task) -> Self {
        Self {
            inner: Arc::new(TaskCell {
                name: name.into(),
                multiplicity: AtomicU32::new(0),
                never_nests: AtomicBool::new(false),
                on_finished: Mutex::new(None),
                state: TaskState {
                    remaining_runs: AtomicU32::new(0),
                    scheduled: AtomicBool::new(false),
                    cancel_requested: AtomicBool::new(false),
                    group: Mutex::new(None),
                },
                body: Box::new(body),
            }),
        }
    }

    /// Same as [`SharedTask::new`], spelled out for closures.
    pub fn from_fn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TaskContext<'_>) + Send + Sync + 'static,
    {
        Self::new(name, body)
    }

    /// Sets the multiplicity and returns the task, for builder-style construction.
    pub fn with_multiplicity(self, multiplicity: u32) -> Self {
        self.set_multiplicity(multiplicity);
        self
    }

    /// Sets the nesting mode and returns the task, for builder-style construction.
    pub fn with_nesting(self, nesting: TaskNesting) -> Self {
        self.set_nesting(nesting);
        self
    }

    /// Sets how many times the task runs per scheduling. `0` and `1` both mean once.
    ///
    /// # Panics
    /// Panics if the task is currently part of an unfinished group.
    pub fn set_multiplicity(&self, multiplicity: u32) {
        assert!(
            self.is_finished(),
            "Cannot change the multiplicity of task '{}' while it is in use",
            self.name()
        );
        self.inner.multiplicity.store(multiplicity, Ordering::Release);
    }

    /// Sets whether the task may wait on other work.
    pub fn set_nesting(&self, nesting: TaskNesting) {
        self.inner
            .never_nests
            .store(nesting == TaskNesting::Never, Ordering::Release);
    }

    /// Installs a callback that fires once the final invocation of each scheduling finishes.
    pub fn set_on_task_finished(&self, callback: impl Fn(&SharedTask) + Send + Sync + 'static) {
        *lock(&self.inner.on_finished) = Some(Arc::new(callback));
    }

    /// The task's diagnostic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The declared multiplicity, as passed to [`SharedTask::set_multiplicity`].
    pub fn multiplicity(&self) -> u32 {
        self.inner.multiplicity.load(Ordering::Acquire)
    }

    /// The number of queue entries one scheduling of this task produces.
    pub fn effective_multiplicity(&self) -> u32 {
        self.multiplicity().max(1)
    }

    /// The task's nesting mode.
    pub fn nesting(&self) -> TaskNesting {
        if self.inner.never_nests.load(Ordering::Acquire) {
            TaskNesting::Never
        } else {
            TaskNesting::Maybe
        }
    }

    /// `true` when no invocation of the task is queued or running.
    pub fn is_finished(&self) -> bool {
        self.inner.state.remaining_runs.load(Ordering::Acquire) == 0
    }

    /// `true` once cancellation was requested for the current scheduling.
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.state.cancel_requested.load(Ordering::Acquire)
    }

    /// `true` if both handles refer to the same task.
    pub fn ptr_eq(&self, other: &SharedTask) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Prepares the task for a new scheduling as part of `group`.
    pub(crate) fn reset(&self, group: TaskGroupId) {
        let state = &self.inner.state;
        state
            .remaining_runs
            .store(self.effective_multiplicity(), Ordering::Release);
        state.scheduled.store(false, Ordering::Release);
        state.cancel_requested.store(false, Ordering::Release);
        *lock(&state.group) = Some(group);
    }

    /// Marks the task as queued and resets its run counter to its multiplicity.
    pub(crate) fn mark_scheduled(&self) -> u32 {
        let runs = self.effective_multiplicity();
        let state = &self.inner.state;
        state.remaining_runs.store(runs, Ordering::Release);
        state.scheduled.store(true, Ordering::Release);
        runs
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.inner.state.scheduled.load(Ordering::Acquire)
    }

    /// The group this task was last added to.
    pub(crate) fn group(&self) -> Option<TaskGroupId> {
        lock(&self.inner.state.group).clone()
    }

    /// Sets the cancel flag and calls the body's cancellation hook the first time.
    pub(crate) fn request_cancel(&self) {
        if !self.inner.state.cancel_requested.swap(true, Ordering::AcqRel) {
            self.inner.body.on_cancel_requested();
        }
    }

    /// Drops `runs` pending invocations that will never execute.
    ///
    /// # Returns
    /// `true` if no invocation is left afterwards.
    pub(crate) fn discard_runs(&self, runs: u32) -> bool {
        let previous = self.inner.state.remaining_runs.fetch_sub(runs, Ordering::AcqRel);
        debug_assert!(previous >= runs, "Task '{}' run counter underflow", self.name());
        previous == runs
    }

    /// Forgets every pending invocation of a task that was never queued.
    pub(crate) fn discard_all_runs(&self) {
        self.inner.state.remaining_runs.store(0, Ordering::Release);
    }

    /// Executes one invocation and counts it as done.
    ///
    /// # Returns
    /// `true` if this was the final outstanding invocation.
    pub(crate) fn run(&self, invocation: u32) -> bool {
        let cell = &self.inner;

        if cell.state.remaining_runs.load(Ordering::Acquire) == 0 {
            log::warn!("Task '{}' ran with no remaining runs", cell.name);
            return false;
        }

        let ctx = TaskContext {
            invocation,
            name: &cell.name,
            cancel_requested: &cell.state.cancel_requested,
        };
        cell.body.execute(&ctx);

        cell.state.remaining_runs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Runs the finished callback, if one is installed.
    pub(crate) fn notify_finished(&self) {
        let callback = lock(&self.inner.on_finished).clone();
        if let Some(callback) = callback {
            callback(self);
        }
    }
}

impl fmt::Debug for SharedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTask")
            .field("name", &self.inner.name)
            .field("multiplicity", &self.multiplicity())
            .field("nesting", &self.nesting())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn new_tasks_are_finished() {
        let task = SharedTask::from_fn("noop", |_: &TaskContext<'_>| {});

        assert!(task.is_finished());
        assert!(!task.is_cancel_requested());
        assert_eq!(task.nesting(), TaskNesting::Maybe);
        assert_eq!(task.effective_multiplicity(), 1);
    }

    #[test]
    fn run_counts_down_invocations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = SharedTask::from_fn("count", {
            let calls = calls.clone();
            move |_: &TaskContext<'_>| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        })
        .with_multiplicity(3);

        assert_eq!(task.mark_scheduled(), 3);
        assert!(!task.is_finished());
        assert!(!task.run(0));
        assert!(!task.run(1));
        assert!(task.run(2));
        assert!(task.is_finished());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancel_hook_fires_once() {
        struct Hooked(Arc<AtomicUsize>);

        impl Task for Hooked {
            fn execute(&self, _: &TaskContext<'_>) {}

            fn on_cancel_requested(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hooks = Arc::new(AtomicUsize::new(0));
        let task = SharedTask::new("hooked", Hooked(hooks.clone()));
        task.request_cancel();
        task.request_cancel();

        assert!(task.is_cancel_requested());
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "while it is in use")]
    fn multiplicity_is_frozen_while_scheduled() {
        let task = SharedTask::from_fn("busy", |_: &TaskContext<'_>| {});
        task.mark_scheduled();
        task.set_multiplicity(4);
    }
}
