//! # Frame Tasks
//!
//! Per-frame housekeeping the main thread calls once per frame.
//!
//! `SomeFrameMainThread` work (typically uploading what was loaded in the background) does
//! not have to run right away, but the sooner the better. While frames are fast it is drained
//! completely. When a frame spikes the work is skipped, and every skipped frame raises a
//! threshold a little, so even at a constantly low frame rate progress is eventually made.

use std::time::Duration;

use web_time::Instant;

use super::{priority::TaskPriority, Scheduler};

/// Threshold growth for every frame the pumping is skipped.
const THRESHOLD_STEP: Duration = Duration::from_micros(200);

/// Queue lengths above which one extra task per frame is forced.
const BACKLOG_LEVELS: [usize; 3] = [100, 75, 50];

const SOME_FRAME_RANGE: &[(TaskPriority, TaskPriority)] = &[(
    TaskPriority::SomeFrameMainThread,
    TaskPriority::SomeFrameMainThread,
)];

const THIS_FRAME_MAIN_RANGE: &[(TaskPriority, TaskPriority)] = &[(
    TaskPriority::ThisFrameMainThread,
    TaskPriority::ThisFrameMainThread,
)];

const THIS_FRAME_RANGE: &[(TaskPriority, TaskPriority)] =
    &[(TaskPriority::EarlyThisFrame, TaskPriority::LateThisFrame)];

/// Pacing state carried from one `execute_some_frame_tasks` call to the next.
#[derive(Debug, Default)]
pub(crate) struct FramePacing {
    threshold: Option<Duration>,
    last_execution: Option<Instant>,
    last_utilization_update: Option<Instant>,
}

impl Scheduler {
    /// Finishes the current frame's work on the main thread.
    ///
    /// Executes `ThisFrameMainThread` tasks, then helps with the this-frame tiers until
    /// nothing is left that is not already being worked on. Afterwards the frame-relative
    /// queues move one frame closer and some `SomeFrameMainThread` work is pumped, paced by
    /// the configured target frame time. Finally every worker's utilization is updated for
    /// the frame that just ended.
    ///
    /// # Panics
    /// Panics if not called on the main thread.
    pub fn finish_frame_tasks(&self) {
        assert!(
            self.is_main_thread(),
            "finish_frame_tasks must be called on the main thread"
        );

        loop {
            if self.execute_task(THIS_FRAME_MAIN_RANGE, false, None, None) {
                continue;
            }
            if self.execute_task(THIS_FRAME_RANGE, false, None, None) {
                continue;
            }
            break;
        }

        self.reprioritize_frame_tasks();
        self.execute_some_frame_tasks(self.config.target_frame_time());
        self.update_thread_utilization();
    }

    /// Measures the time since the previous update and hands it to every worker.
    ///
    /// The first call only starts the clock. A zero-length frame is skipped.
    fn update_thread_utilization(&self) {
        let now = Instant::now();
        let frame = {
            let mut state = self.lock_state();
            let last = state.frame_pacing.last_utilization_update.get_or_insert(now);
            let frame = now.duration_since(*last);
            if frame.is_zero() {
                return;
            }
            *last = now;
            frame
        };

        for worker in self.workers.iter().flatten() {
            worker.update_utilization(frame);
        }
    }

    /// Moves every frame-relative queue one frame closer.
    ///
    /// Leftover `ThisFrame` and `LateThisFrame` work goes to `EarlyThisFrame`, the next-frame
    /// tiers become the matching this-frame tiers and every "in N frames" tier becomes the
    /// "in N-1 frames" tier (`In2Frames` becomes `LateNextFrame`). Entries keep their order.
    pub fn reprioritize_frame_tasks(&self) {
        let mut state = self.lock_state();
        let queues = &mut state.queues;

        let early = TaskPriority::EarlyThisFrame.index();
        for from in TaskPriority::ThisFrame.index()..=TaskPriority::LateThisFrame.index() {
            let moved = std::mem::take(&mut queues[from]);
            queues[early].extend(moved);
        }

        for from in TaskPriority::EarlyNextFrame.index()..=TaskPriority::LateNextFrame.index() {
            let moved = std::mem::take(&mut queues[from]);
            queues[from - 3].extend(moved);
        }

        for from in TaskPriority::In2Frames.index()..=TaskPriority::In9Frames.index() {
            let moved = std::mem::take(&mut queues[from]);
            queues[from - 1].extend(moved);
        }
    }

    /// Pumps the `SomeFrameMainThread` queue on the calling thread.
    ///
    /// As long as less than `smooth_frame_time` has passed since the previous call, tasks are
    /// executed back to back. If the queue drains the pacing threshold resets. Otherwise one
    /// task runs if the frame was still within the threshold, else the threshold grows. On
    /// top of that a long backlog forces up to three extra tasks.
    pub fn execute_some_frame_tasks(&self, smooth_frame_time: Duration) {
        let now = Instant::now();
        let (threshold, last) = {
            let mut state = self.lock_state();
            let pacing = &mut state.frame_pacing;
            let threshold = *pacing.threshold.get_or_insert(smooth_frame_time);
            (threshold, pacing.last_execution.replace(now))
        };

        // The very first call counts as an arbitrarily long frame.
        let since_last = |current: Instant| {
            last.map_or(Duration::MAX, |last| current.duration_since(last))
        };

        let mut current = now;
        while since_last(current) < smooth_frame_time {
            if !self.execute_task(SOME_FRAME_RANGE, false, None, None) {
                self.lock_state().frame_pacing.threshold = Some(smooth_frame_time);
                return;
            }
            current = Instant::now();
        }

        let backlog = self.queued_task_count(TaskPriority::SomeFrameMainThread);
        if backlog == 0 {
            return;
        }

        if since_last(current) < threshold {
            // From here on at least one task per frame, until the queue drains.
            self.execute_task(SOME_FRAME_RANGE, false, None, None);
        } else {
            self.lock_state().frame_pacing.threshold = Some(threshold + THRESHOLD_STEP);
            log::trace!("Skipped frame tasks, {backlog} queued");
        }

        for level in BACKLOG_LEVELS {
            if backlog > level {
                self.execute_task(SOME_FRAME_RANGE, false, None, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::task_system::{
        SharedTask, TaskContext, TaskSystem, TaskSystemConfig, ThreadUtilization, WorkerThreadType,
    };

    fn manual_system() -> TaskSystem {
        TaskSystem::new(TaskSystemConfig::without_workers()).unwrap()
    }

    fn queue_named(system: &TaskSystem, priority: TaskPriority, name: &str) {
        system.start_single_task(
            SharedTask::from_fn(name, |_: &TaskContext<'_>| {}),
            priority,
            None,
            None,
        );
    }

    fn queue_uploads(system: &TaskSystem, count: usize, runs: &Arc<AtomicUsize>) {
        for index in 0..count {
            let runs = runs.clone();
            system.start_single_task(
                SharedTask::from_fn(format!("upload {index}"), move |_: &TaskContext<'_>| {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
                TaskPriority::SomeFrameMainThread,
                None,
                None,
            );
        }
    }

    fn names(system: &TaskSystem, priority: TaskPriority) -> Vec<String> {
        system.lock_state().queues[priority.index()]
            .iter()
            .map(|entry| entry.task.name().to_string())
            .collect()
    }

    #[test]
    fn queues_move_one_frame_closer() {
        let system = manual_system();
        queue_named(&system, TaskPriority::EarlyThisFrame, "early");
        queue_named(&system, TaskPriority::ThisFrame, "this");
        queue_named(&system, TaskPriority::LateThisFrame, "late");
        queue_named(&system, TaskPriority::NextFrame, "next");
        queue_named(&system, TaskPriority::LateNextFrame, "late next");
        queue_named(&system, TaskPriority::In2Frames, "in 2");
        queue_named(&system, TaskPriority::In9Frames, "in 9");

        system.reprioritize_frame_tasks();

        assert_eq!(names(&system, TaskPriority::EarlyThisFrame), ["early", "this", "late"]);
        assert_eq!(names(&system, TaskPriority::ThisFrame), ["next"]);
        assert_eq!(names(&system, TaskPriority::LateThisFrame), ["late next"]);
        assert_eq!(names(&system, TaskPriority::LateNextFrame), ["in 2"]);
        assert_eq!(names(&system, TaskPriority::In8Frames), ["in 9"]);
        assert!(names(&system, TaskPriority::In9Frames).is_empty());
    }

    #[test]
    fn first_pump_only_clears_a_backlog() {
        let system = manual_system();
        let runs = Arc::new(AtomicUsize::new(0));
        queue_uploads(&system, 3, &runs);

        system.execute_some_frame_tasks(Duration::from_secs(10));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // A fast follow-up frame drains the queue and resets the threshold.
        system.execute_some_frame_tasks(Duration::from_secs(10));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(
            system.lock_state().frame_pacing.threshold,
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn slow_frames_raise_the_threshold_and_force_backlog_progress() {
        let system = manual_system();
        let runs = Arc::new(AtomicUsize::new(0));
        queue_uploads(&system, 101, &runs);

        system.execute_some_frame_tasks(Duration::ZERO);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(system.lock_state().frame_pacing.threshold, Some(THRESHOLD_STEP));

        std::thread::sleep(Duration::from_millis(1));
        system.execute_some_frame_tasks(Duration::ZERO);
        assert_eq!(system.lock_state().frame_pacing.threshold, Some(THRESHOLD_STEP * 2));
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn finishing_a_frame_runs_this_frame_work() {
        let system = manual_system();
        let runs = Arc::new(AtomicUsize::new(0));
        let counting = |name: &str, priority: TaskPriority| {
            let runs = runs.clone();
            system.start_single_task(
                SharedTask::from_fn(name, move |_: &TaskContext<'_>| {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
                priority,
                None,
                None,
            )
        };

        let main = counting("main", TaskPriority::ThisFrameMainThread);
        let this = counting("this", TaskPriority::LateThisFrame);
        let next = counting("next", TaskPriority::EarlyNextFrame);

        system.finish_frame_tasks();

        assert!(system.is_task_group_finished(&main));
        assert!(system.is_task_group_finished(&this));
        assert!(!system.is_task_group_finished(&next));
        assert_eq!(names(&system, TaskPriority::EarlyThisFrame), ["next"]);

        system.finish_frame_tasks();
        assert!(system.is_task_group_finished(&next));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn frames_measure_worker_utilization() {
        let system = TaskSystem::new(TaskSystemConfig {
            short_task_workers: 0,
            long_task_workers: 1,
            file_access_workers: 0,
            ..TaskSystemConfig::default()
        })
        .unwrap();

        let idle = system.thread_utilization(WorkerThreadType::LongTasks, 0);
        assert_eq!(idle, Some(ThreadUtilization::default()));
        let missing = system.thread_utilization(WorkerThreadType::LongTasks, 1);
        assert_eq!(missing, None);
        let main = system.thread_utilization(WorkerThreadType::MainThread, 0);
        assert_eq!(main, None);

        system.finish_frame_tasks();

        // Long running work is never helped with by the main thread.
        let busy = system.start_single_task(
            SharedTask::from_fn("busy", |_: &TaskContext<'_>| {
                std::thread::sleep(Duration::from_millis(20));
            }),
            TaskPriority::LongRunning,
            None,
            None,
        );
        system.wait_for_group(&busy);
        std::thread::sleep(Duration::from_millis(5));
        system.finish_frame_tasks();

        let frame = system
            .thread_utilization(WorkerThreadType::LongTasks, 0)
            .unwrap();
        assert_eq!(frame.tasks_executed, 1);
        assert!(
            frame.busy_fraction > 0.0 && frame.busy_fraction < 1.0,
            "{frame:?}"
        );

        std::thread::sleep(Duration::from_millis(1));
        system.finish_frame_tasks();
        let quiet = system
            .thread_utilization(WorkerThreadType::LongTasks, 0)
            .unwrap();
        assert_eq!(quiet, ThreadUtilization::default());
    }

    #[test]
    #[should_panic(expected = "main thread")]
    fn finishing_a_frame_off_the_main_thread_panics() {
        let system = manual_system();
        let scheduler = system.scheduler();

        let result = std::thread::spawn(move || scheduler.finish_frame_tasks()).join();
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }
}
