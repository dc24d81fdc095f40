//! Picking, executing and cancelling individual task invocations, and the completion cascade
//! that runs when the last invocation of a group is done.

use std::sync::{atomic::Ordering, Arc};

use web_time::Instant;

use crate::core::{AtomicWorkerState, WorkerState};

use super::{
    error::CancelError,
    group::{GroupSlot, OnTaskGroupFinished, ScheduledTask, TaskGroupId},
    priority::{TaskPriority, WorkerThreadType},
    task::{SharedTask, TaskNesting},
    workers, OnTaskRunning, Scheduler,
};

impl Scheduler {
    /// Convenience for the common "one task, one group" case.
    ///
    /// Creates a group holding only `task`, optionally makes it depend on `dependency`,
    /// and starts it.
    ///
    /// # Returns
    /// The handle of the new group.
    pub fn start_single_task(
        &self,
        task: SharedTask,
        priority: TaskPriority,
        dependency: Option<&TaskGroupId>,
        on_finished: Option<OnTaskGroupFinished>,
    ) -> TaskGroupId {
        let group = self.create_task_group(priority, on_finished);
        self.add_task_to_group(&group, task);
        if let Some(dependency) = dependency {
            self.add_task_group_dependency(&group, dependency);
        }
        self.start_task_group(&group);
        group
    }

    /// Cancels a single task.
    ///
    /// The cancel flag is raised first so running bodies can bail out early. Invocations that
    /// have not started are dropped without running. Invocations that are already running
    /// finish normally.
    ///
    /// # Returns
    /// `Ok` if the task was stopped before any of its invocations ran into it.
    ///
    /// # Errors
    /// [`CancelError::TaskStillRunning`] if an invocation was already executing. With
    /// [`OnTaskRunning::WaitTillFinished`] the error is only returned once it has completed.
    pub fn cancel_task(
        &self,
        task: &SharedTask,
        on_running: OnTaskRunning,
    ) -> Result<(), CancelError> {
        if task.is_finished() {
            return Ok(());
        }

        task.request_cancel();

        let mut removed: Option<(Arc<GroupSlot>, u32)> = None;
        {
            let mut state = self.lock_state();

            if !task.is_scheduled() {
                // Still only part of its group's task list.
                if let Some(group) = task.group() {
                    if let Some(slot) = group.slot() {
                        let data = &mut state.groups[slot.index];
                        if data.is_current(&group) {
                            data.tasks.retain(|other| !other.ptr_eq(task));
                        }
                    }
                }
                task.discard_all_runs();
                log::debug!("Cancelled task '{}' before it was scheduled", task.name());
                return Ok(());
            }

            for queue in state.queues.iter_mut() {
                queue.retain(|entry| {
                    if !entry.task.ptr_eq(task) {
                        return true;
                    }
                    match &mut removed {
                        Some((_, count)) => *count += 1,
                        None => removed = Some((entry.group.clone(), 1)),
                    }
                    false
                });
            }
        }

        // Finishing may cascade into other groups, which needs the lock again.
        if let Some((slot, count)) = removed {
            log::debug!(
                "Removed {count} queued invocations of task '{}'",
                task.name()
            );
            let last = task.discard_runs(count);
            self.task_has_finished(last.then_some(task), &slot, count);
        }

        if task.is_finished() {
            return Ok(());
        }

        match on_running {
            OnTaskRunning::WaitTillFinished => {
                log::debug!("Waiting for running task '{}' to complete", task.name());
                self.wait_for_condition(|| task.is_finished());
            }
            OnTaskRunning::ReturnWithoutBlocking => {
                log::warn!(
                    "Task '{}' is already running and cannot be cancelled",
                    task.name()
                );
            }
        }

        Err(CancelError::TaskStillRunning {
            name: task.name().to_string(),
        })
    }

    /// Lets a waiting thread execute one queued invocation it is allowed to run.
    ///
    /// The main thread takes anything in its ranges. Every other thread only takes tasks
    /// that never wait, or tasks of the group it is waiting for, so it cannot end up
    /// blocked inside something that depends on its own caller.
    ///
    /// # Returns
    /// `true` if an invocation was executed.
    pub(crate) fn help_executing_tasks(
        &self,
        worker_type: WorkerThreadType,
        waiting_for: Option<&TaskGroupId>,
    ) -> bool {
        let only_never_wait = worker_type != WorkerThreadType::MainThread;
        self.execute_task(
            worker_type.priority_ranges(),
            only_never_wait,
            waiting_for,
            None,
        )
    }

    /// Pops and runs one invocation from the given tier ranges.
    ///
    /// # Arguments
    /// * `ranges` - Inclusive tier ranges, searched in order
    /// * `only_never_wait` - Restrict to `Never` tasks and tasks of `waiting_for`
    /// * `waiting_for` - The group the calling thread is blocked on, if any
    /// * `worker_state` - The calling worker's state; set to `Idle` if nothing was found
    ///
    /// # Returns
    /// `true` if an invocation was executed.
    pub(crate) fn execute_task(
        &self,
        ranges: &[(TaskPriority, TaskPriority)],
        only_never_wait: bool,
        waiting_for: Option<&TaskGroupId>,
        worker_state: Option<&AtomicWorkerState>,
    ) -> bool {
        let Some(entry) = self.next_task(ranges, only_never_wait, waiting_for, worker_state) else {
            return false;
        };

        let ScheduledTask {
            task,
            group,
            invocation,
        } = entry;

        let started = Instant::now();
        let last = {
            let _running = workers::enter_task(&task);
            task.run(invocation)
        };
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        if let Some(worker) = workers::current_worker(self.id) {
            worker.record_task(started.elapsed());
        }

        self.task_has_finished(last.then_some(&task), &group, 1);
        true
    }

    fn next_task(
        &self,
        ranges: &[(TaskPriority, TaskPriority)],
        only_never_wait: bool,
        waiting_for: Option<&TaskGroupId>,
        worker_state: Option<&AtomicWorkerState>,
    ) -> Option<ScheduledTask> {
        let mut state = self.lock_state();

        let eligible = |entry: &ScheduledTask| {
            !only_never_wait
                || entry.task.nesting() == TaskNesting::Never
                || waiting_for
                    .is_some_and(|group| group.refers_to(&entry.group) && !group.is_finished())
        };

        for &(first, last) in ranges {
            for index in first.index()..=last.index() {
                let queue = &mut state.queues[index];
                if let Some(position) = queue.iter().position(&eligible) {
                    return queue.remove(position);
                }
            }
        }

        if let Some(worker_state) = worker_state {
            // Under the lock, so a producer queueing right after sees us idle and wakes us.
            let previous = worker_state.swap(WorkerState::Idle);
            debug_assert_eq!(previous, WorkerState::Active, "Corrupt worker state");
        }

        None
    }

    /// Accounts for `count` finished invocations of the group in `slot`.
    ///
    /// # Arguments
    /// * `task` - The task whose final invocation this was, to fire its finished callback
    /// * `slot` - The group the invocations belonged to
    /// * `count` - How many invocations finished, ran or discarded
    pub(crate) fn task_has_finished(
        &self,
        task: Option<&SharedTask>,
        slot: &Arc<GroupSlot>,
        count: u32,
    ) {
        if let Some(task) = task {
            task.notify_finished();
        }

        let count = count as i32;
        let previous = slot.num_remaining_tasks.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(
            previous >= count,
            "Group {} finished more tasks than it had",
            slot.index
        );

        if previous == count {
            self.finish_group(slot);
        }

        self.notify_progress();
    }

    /// Runs the completion cascade of the group in `slot`.
    ///
    /// Handles go stale first, so nobody can register new dependents. Then dormant
    /// dependents whose last dependency this was are queued at the front of their tier,
    /// waiters are woken and the completion callback runs. The slot becomes reusable last.
    fn finish_group(&self, slot: &Arc<GroupSlot>) {
        let generation = slot.mark_finished();

        let (dependents, on_finished) = {
            let mut state = self.lock_state();
            let data = &mut state.groups[slot.index];
            data.tasks.clear();
            (
                std::mem::take(&mut data.others_depending_on_me),
                data.on_finished.take(),
            )
        };

        let ready: Vec<Arc<GroupSlot>> = dependents
            .iter()
            .filter_map(TaskGroupId::slot)
            .filter(|dependent| {
                dependent.num_active_dependencies.fetch_sub(1, Ordering::AcqRel) == 1
            })
            .cloned()
            .collect();

        log::trace!(
            "Group {} finished, releasing {} of {} dependents",
            slot.index,
            ready.len(),
            dependents.len()
        );

        for dependent in &ready {
            self.schedule_group_tasks(dependent, true);
        }

        slot.notify_finished();

        if let Some(on_finished) = on_finished {
            on_finished(TaskGroupId::new(slot.clone(), generation));
        }

        self.lock_state().groups[slot.index].in_use = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::task_system::{task::TaskContext, TaskSystem, TaskSystemConfig};

    fn manual_system() -> TaskSystem {
        TaskSystem::new(TaskSystemConfig::without_workers()).unwrap()
    }

    fn counting(name: &str, runs: &Arc<AtomicUsize>) -> SharedTask {
        let runs = runs.clone();
        SharedTask::from_fn(name, move |_: &TaskContext<'_>| {
            runs.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn single_task_groups_respect_their_dependency() {
        let system = manual_system();
        let runs = Arc::new(AtomicUsize::new(0));

        let first = system.create_task_group(TaskPriority::ThisFrame, None);
        system.add_task_to_group(&first, counting("first", &runs));

        let second = system.start_single_task(
            counting("second", &runs),
            TaskPriority::ThisFrame,
            Some(&first),
            None,
        );
        assert_eq!(system.queued_task_count(TaskPriority::ThisFrame), 0);

        system.start_task_group(&first);
        system.wait_for_group(&second);

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(system.is_task_group_finished(&first));
    }

    #[test]
    fn finished_callback_fires_after_the_last_invocation() {
        let system = manual_system();
        let runs = Arc::new(AtomicUsize::new(0));
        let callbacks = Arc::new(AtomicUsize::new(0));

        let task = counting("fan", &runs).with_multiplicity(3);
        task.set_on_task_finished({
            let runs = runs.clone();
            let callbacks = callbacks.clone();
            move |task: &SharedTask| {
                assert!(task.is_finished());
                assert_eq!(runs.load(Ordering::SeqCst), 3);
                callbacks.fetch_add(1, Ordering::SeqCst);
            }
        });

        let group = system.start_single_task(task.clone(), TaskPriority::ThisFrame, None, None);
        system.wait_for_group(&group);
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);

        // Finished tasks can be scheduled again and behave the same.
        let again = system.start_single_task(task, TaskPriority::ThisFrame, None, None);
        system.wait_for_group(&again);
        assert_eq!(runs.load(Ordering::SeqCst), 6);
        assert_eq!(callbacks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancelling_a_queued_task_finishes_its_group() {
        let system = manual_system();
        let runs = Arc::new(AtomicUsize::new(0));
        let task = counting("queued", &runs).with_multiplicity(2);

        let group = system.start_single_task(task.clone(), TaskPriority::NextFrame, None, None);
        assert_eq!(system.queued_task_count(TaskPriority::NextFrame), 2);

        assert_eq!(
            system.cancel_task(&task, OnTaskRunning::ReturnWithoutBlocking),
            Ok(())
        );
        assert!(task.is_finished());
        assert!(task.is_cancel_requested());
        assert!(system.is_task_group_finished(&group));
        assert_eq!(system.queued_task_count(TaskPriority::NextFrame), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelling_an_unscheduled_task_removes_it_from_its_group() {
        let system = manual_system();
        let runs = Arc::new(AtomicUsize::new(0));
        let kept = counting("kept", &runs);
        let dropped = counting("dropped", &runs);

        let group = system.create_task_group(TaskPriority::ThisFrame, None);
        system.add_task_to_group(&group, kept);
        system.add_task_to_group(&group, dropped.clone());

        system
            .cancel_task(&dropped, OnTaskRunning::ReturnWithoutBlocking)
            .unwrap();
        assert!(dropped.is_finished());

        system.start_task_group(&group);
        assert_eq!(system.queued_task_count(TaskPriority::ThisFrame), 1);
        system.wait_for_group(&group);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelling_a_finished_task_is_a_no_op() {
        let system = manual_system();
        let task = SharedTask::from_fn("done", |_: &TaskContext<'_>| {});

        assert_eq!(system.cancel_task(&task, OnTaskRunning::WaitTillFinished), Ok(()));
        assert!(!task.is_cancel_requested());
    }

    #[test]
    fn helping_threads_only_take_tasks_that_never_wait() {
        let system = manual_system();
        let runs = Arc::new(AtomicUsize::new(0));

        system.start_single_task(
            counting("may wait", &runs),
            TaskPriority::ThisFrame,
            None,
            None,
        );
        system.start_single_task(
            counting("never waits", &runs).with_nesting(TaskNesting::Never),
            TaskPriority::ThisFrame,
            None,
            None,
        );

        assert!(system.help_executing_tasks(WorkerThreadType::Unknown, None));
        assert!(!system.help_executing_tasks(WorkerThreadType::Unknown, None));
        assert_eq!(system.queued_task_count(TaskPriority::ThisFrame), 1);

        assert!(system.help_executing_tasks(WorkerThreadType::MainThread, None));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(system.stats().tasks_executed, 2);
    }

    #[test]
    #[should_panic(expected = "never wait")]
    fn never_nesting_tasks_must_not_wait() {
        let system = manual_system();
        let scheduler = system.scheduler();
        let other = system.create_task_group(TaskPriority::ThisFrame, None);

        let waiter = SharedTask::from_fn("impatient", move |_: &TaskContext<'_>| {
            scheduler.wait_for_group(&other);
        })
        .with_nesting(TaskNesting::Never);

        let group = system.start_single_task(waiter, TaskPriority::ThisFrame, None, None);
        system.wait_for_group(&group);
    }
}
