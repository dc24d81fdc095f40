//! Group lifecycle: creation, composition, start with dependency resolution, queueing,
//! cancellation and blocking waits.

use std::{
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use crate::core::{lock, WorkerState};

use super::{
    error::CancelError,
    group::{
        GroupData, GroupSlot, OnTaskGroupFinished, ScheduledTask, TaskGroupDependency,
        TaskGroupId,
    },
    priority::{TaskPriority, WorkerThreadType},
    task::SharedTask,
    workers, OnTaskRunning, Scheduler, SchedulerState,
};

/// How long a thread blocked in `wait_for_condition` sleeps before re-evaluating the
/// condition without having been notified. Conditions may depend on more than task progress.
const CONDITION_POLL_INTERVAL: Duration = Duration::from_millis(1);

impl Scheduler {
    /// Creates a new, empty task group.
    ///
    /// Reuses the first arena slot that is not in use, or grows the arena.
    ///
    /// # Arguments
    /// * `priority` - Tier all tasks of the group are queued in
    /// * `on_finished` - Called once, on whichever thread finishes the group, with the
    ///   group's (by then stale) handle
    ///
    /// # Returns
    /// A handle that stays valid until the group finishes.
    pub fn create_task_group(
        &self,
        priority: TaskPriority,
        on_finished: Option<OnTaskGroupFinished>,
    ) -> TaskGroupId {
        let mut state = self.lock_state();

        let index = match state.groups.iter().position(|group| !group.in_use) {
            Some(index) => index,
            None => {
                let index = state.groups.len();
                state.groups.push(GroupData::new(index));
                index
            }
        };

        state.groups[index].reuse(priority, on_finished)
    }

    /// Adds `task` to a group that has not been started yet.
    ///
    /// # Panics
    /// Panics if the task is still in use by another group, has an empty name, if the group
    /// was already started, or if `group` does not refer to a live group of this scheduler.
    pub fn add_task_to_group(&self, group: &TaskGroupId, task: SharedTask) {
        assert!(
            task.is_finished(),
            "The task '{}' is not finished! Cannot reuse a task before it is done.",
            task.name()
        );
        assert!(!task.name().is_empty(), "Every task should have a name");

        let mut state = self.lock_state();
        let data = Self::group_data(&mut state, group);
        assert!(
            !data.started_by_user,
            "Cannot add task '{}' to group {group:?} after it has been started",
            task.name()
        );

        task.reset(group.clone());
        data.tasks.push(task);
    }

    /// Declares that `group` may only start once `depends_on` has finished.
    ///
    /// Dependencies are only resolved when `group` is started; `depends_on` finishing
    /// before that is fine.
    ///
    /// # Panics
    /// Panics if `depends_on` is invalid, if a group would depend on itself, or if `group`
    /// has already been started.
    pub fn add_task_group_dependency(&self, group: &TaskGroupId, depends_on: &TaskGroupId) {
        let mut state = self.lock_state();
        Self::add_dependency_locked(&mut state, group, depends_on);
    }

    /// Adds several dependencies while taking the scheduler lock only once.
    pub fn add_task_group_dependency_batch(&self, batch: &[TaskGroupDependency]) {
        let mut state = self.lock_state();
        for dependency in batch {
            Self::add_dependency_locked(&mut state, &dependency.task_group, &dependency.depends_on);
        }
    }

    fn add_dependency_locked(
        state: &mut SchedulerState,
        group: &TaskGroupId,
        depends_on: &TaskGroupId,
    ) {
        assert!(depends_on.is_valid(), "Invalid dependency");
        assert!(group != depends_on, "Group cannot depend on itself");

        let data = Self::group_data(state, group);
        assert!(
            !data.started_by_user,
            "Cannot add dependencies to group {group:?} after it has been started"
        );
        data.depends_on.push(depends_on.clone());
    }

    /// Starts a group.
    ///
    /// Dependencies that already finished are ignored. If others are still pending, the
    /// group registers itself with them and stays dormant until the last one finishes;
    /// otherwise its tasks are queued right away.
    pub fn start_task_group(&self, group: &TaskGroupId) {
        let active_dependencies = {
            let mut state = self.lock_state();
            Self::register_dependencies_locked(&mut state, group)
        };

        if active_dependencies == 0 {
            if let Some(slot) = group.slot() {
                self.schedule_group_tasks(slot, false);
            }
        } else {
            log::debug!("Group {group:?} waits for {active_dependencies} dependencies");
        }
    }

    /// Starts several groups. Groups whose dependencies are all done are queued in order.
    pub fn start_task_group_batch(&self, batch: &[TaskGroupId]) {
        let ready: Vec<Arc<GroupSlot>> = {
            let mut state = self.lock_state();
            batch
                .iter()
                .filter(|group| Self::register_dependencies_locked(&mut state, group) == 0)
                .filter_map(|group| group.slot().cloned())
                .collect()
        };

        for slot in &ready {
            self.schedule_group_tasks(slot, false);
        }
    }

    /// Marks `group` as started and links it to its unfinished dependencies.
    ///
    /// # Returns
    /// The number of dependencies the group still waits for.
    fn register_dependencies_locked(state: &mut SchedulerState, group: &TaskGroupId) -> i32 {
        let data = Self::group_data(state, group);
        data.started_by_user = true;
        let dependencies = data.depends_on.clone();

        let mut active_dependencies = 0;
        for dependency in dependencies
            .iter()
            .filter(|dependency| !dependency.is_finished())
        {
            if let Some(slot) = dependency.slot() {
                state.groups[slot.index].others_depending_on_me.push(group.clone());
                active_dependencies += 1;
            }
        }

        if active_dependencies != 0 {
            if let Some(slot) = group.slot() {
                slot.num_active_dependencies
                    .store(active_dependencies, Ordering::Release);
            }
        }

        active_dependencies
    }

    /// `true` once the group has finished. Stays `true` for this handle forever.
    pub fn is_task_group_finished(&self, group: &TaskGroupId) -> bool {
        group.is_finished()
    }

    /// Queues every invocation of every task in the group and wakes matching workers.
    ///
    /// An empty group gets one synthetic invocation that is finished immediately, which
    /// runs the regular completion cascade.
    ///
    /// # Arguments
    /// * `high_priority` - Push to the front of the tier's queue instead of the back. Used
    ///   when a dormant group is released by its last dependency
    pub(crate) fn schedule_group_tasks(&self, slot: &Arc<GroupSlot>, high_priority: bool) {
        let mut state = self.lock_state();

        if state.groups[slot.index].tasks.is_empty() {
            drop(state);
            slot.num_remaining_tasks.store(1, Ordering::Release);
            self.task_has_finished(None, slot, 1);
            return;
        }

        let SchedulerState { groups, queues, .. } = &mut *state;
        let data = &groups[slot.index];
        let priority = data.priority;
        let entries: Vec<ScheduledTask> = data
            .tasks
            .iter()
            .flat_map(|task| {
                let runs = task.mark_scheduled();
                (0..runs).map(move |invocation| ScheduledTask {
                    task: task.clone(),
                    group: slot.clone(),
                    invocation,
                })
            })
            .collect();

        let remaining = entries.len();
        slot.num_remaining_tasks
            .store(remaining as i32, Ordering::Release);

        let queue = &mut queues[priority.index()];
        if high_priority {
            // Reversed so the group keeps its own submission order at the front.
            for entry in entries.into_iter().rev() {
                queue.push_front(entry);
            }
        } else {
            queue.extend(entries);
        }

        log::trace!(
            "Queued {remaining} invocations of group {} at {priority:?}{}",
            slot.index,
            if high_priority { " (front)" } else { "" }
        );

        if let Some(worker_type) = priority.worker_type() {
            self.wake_up_threads(worker_type, remaining);
        }
    }

    /// Cancels every task of a group.
    ///
    /// Tasks that have not started are removed. Tasks that are already executing cannot be
    /// stopped; with `WaitTillFinished` the call blocks until they have completed before it
    /// returns. A finished group is a no-op.
    ///
    /// # Errors
    /// [`CancelError::TaskStillRunning`] if any task was already running, also when the call
    /// waited for it to complete.
    pub fn cancel_group(
        &self,
        group: &TaskGroupId,
        on_running: OnTaskRunning,
    ) -> Result<(), CancelError> {
        if group.is_finished() {
            return Ok(());
        }

        let tasks = {
            let state = self.lock_state();
            let data = group
                .slot()
                .and_then(|slot| state.groups.get(slot.index))
                .filter(|data| data.is_current(group));
            match data {
                Some(data) => data.tasks.clone(),
                None => return Ok(()),
            }
        };

        log::debug!("Cancelling {} tasks of group {group:?}", tasks.len());

        let mut result = Ok(());
        for task in &tasks {
            if let Err(err) = self.cancel_task(task, OnTaskRunning::ReturnWithoutBlocking) {
                result = result.and(Err(err));
            }
        }

        if result.is_err() && on_running == OnTaskRunning::WaitTillFinished {
            for task in &tasks {
                // Only running tasks are left, so this just waits for them.
                let _ = self.cancel_task(task, OnTaskRunning::WaitTillFinished);
            }
        }

        result
    }

    /// Blocks until `group` has finished.
    ///
    /// While waiting, the calling thread executes queued work itself. Threads other than
    /// the main thread go to sleep once there is nothing left to help with, after waking an
    /// extra worker to make up for their own lost capacity. The main thread never sleeps;
    /// it yields and keeps helping.
    ///
    /// # Panics
    /// Panics if called from a task flagged with [`TaskNesting::Never`](super::TaskNesting::Never).
    pub fn wait_for_group(&self, group: &TaskGroupId) {
        let worker_type = self.assert_may_wait();
        let allow_sleep = worker_type != WorkerThreadType::MainThread;

        while !group.is_finished() {
            if self.help_executing_tasks(worker_type, Some(group)) {
                continue;
            }

            if !allow_sleep {
                thread::yield_now();
                continue;
            }

            let Some(slot) = group.slot() else {
                return;
            };

            self.block_current_thread(worker_type, || slot.wait_for_finish(group.generation()));
            break;
        }
    }

    /// Blocks until `condition` returns `true`, helping with queued work in the meantime.
    ///
    /// Follows the same rules as [`Scheduler::wait_for_group`]. A sleeping thread wakes
    /// whenever a task invocation finishes, and at least every millisecond.
    ///
    /// # Panics
    /// Panics if called from a task flagged with [`TaskNesting::Never`](super::TaskNesting::Never).
    pub fn wait_for_condition(&self, mut condition: impl FnMut() -> bool) {
        let worker_type = self.assert_may_wait();
        let allow_sleep = worker_type != WorkerThreadType::MainThread;

        while !condition() {
            if self.help_executing_tasks(worker_type, None) {
                continue;
            }

            if !allow_sleep {
                thread::yield_now();
                continue;
            }

            self.block_current_thread(worker_type, || {
                self.condition_waiters.fetch_add(1, Ordering::AcqRel);
                let mut progress = lock(&self.progress);
                while !condition() {
                    progress = self
                        .progress_changed
                        .wait_timeout(progress, CONDITION_POLL_INTERVAL)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
                drop(progress);
                self.condition_waiters.fetch_sub(1, Ordering::AcqRel);
            });
            break;
        }
    }

    fn assert_may_wait(&self) -> WorkerThreadType {
        let (allow_nested, task_name) = workers::nesting_state();
        assert!(
            allow_nested,
            "The executing task '{}' is flagged to never wait for other tasks but does so anyway. \
             Remove the flag or remove the wait-dependency.",
            task_name.as_deref().unwrap_or("<unknown>")
        );
        self.current_worker_type()
    }

    /// Runs `block` with the calling worker marked `Blocked` and a replacement worker woken.
    fn block_current_thread(&self, worker_type: WorkerThreadType, block: impl FnOnce()) {
        let worker = workers::current_worker(self.id);
        if let Some(worker) = &worker {
            let previous = worker.state.swap(WorkerState::Blocked);
            debug_assert_eq!(previous, WorkerState::Active, "Corrupt worker state");
        }

        let type_to_wake = match worker_type {
            WorkerThreadType::Unknown => WorkerThreadType::ShortTasks,
            other => other,
        };
        self.wake_up_threads(type_to_wake, 1);

        block();

        if let Some(worker) = &worker {
            let previous = worker.state.swap(WorkerState::Active);
            debug_assert_eq!(previous, WorkerState::Blocked, "Corrupt worker state");
        }
    }

    /// The live group data `group` refers to.
    ///
    /// # Panics
    /// Panics if the handle belongs to another scheduler. A finished group is only caught in
    /// debug builds.
    fn group_data<'a>(state: &'a mut SchedulerState, group: &TaskGroupId) -> &'a mut GroupData {
        let slot = group
            .slot()
            .unwrap_or_else(|| panic!("Invalid task group handle {group:?}"));
        let data = state
            .groups
            .get_mut(slot.index)
            .filter(|data| Arc::ptr_eq(&data.slot, slot))
            .unwrap_or_else(|| {
                panic!("Task group {group:?} was not created by this scheduler")
            });
        debug_assert!(
            data.is_current(group),
            "Task group {group:?} has already finished"
        );
        data
    }
}
