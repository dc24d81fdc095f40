//! # Priority Tiers
//!
//! Every task group is created with one `TaskPriority`. The tier decides which ready queue
//! the group's tasks go to, and therefore which `WorkerThreadType` picks them up. Callers
//! only choose a semantic tier; they never address worker pools directly.

use std::fmt;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// The scheduling class of a task group.
///
/// The declaration order is significant: it is the queue index, lower tiers are drained
/// first, and frame reprioritisation moves work between neighbouring tiers by index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive)]
pub enum TaskPriority {
    /// Highest priority frame work, guaranteed to be finished this frame.
    EarlyThisFrame,
    /// Work that has to be finished this frame.
    ThisFrame,
    /// Low priority work that still has to be finished this frame.
    LateThisFrame,
    /// Highest priority work for the next frame.
    EarlyNextFrame,
    /// Work for the next frame.
    NextFrame,
    /// Low priority work for the next frame.
    LateNextFrame,
    /// Work due in two frames.
    In2Frames,
    /// Work due in three frames.
    In3Frames,
    /// Work due in four frames.
    In4Frames,
    /// Work due in five frames.
    In5Frames,
    /// Work due in six frames.
    In6Frames,
    /// Work due in seven frames.
    In7Frames,
    /// Work due in eight frames.
    In8Frames,
    /// Work due in nine frames.
    In9Frames,
    /// Long running work that should be picked before other long running work.
    LongRunningHighPriority,
    /// Long running work, may take many frames.
    LongRunning,
    /// File access that should be picked before other file access.
    FileAccessHighPriority,
    /// File access and other blocking I/O.
    FileAccess,
    /// Work that must run on the main thread before the current frame ends.
    ThisFrameMainThread,
    /// Work that must run on the main thread, paced over several frames.
    SomeFrameMainThread,
}

impl TaskPriority {
    /// Number of tiers, and therefore of ready queues.
    pub const COUNT: usize = 20;

    /// Position of this tier in the queue array.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`TaskPriority::index`].
    pub fn from_index(index: usize) -> Option<Self> {
        Self::from_usize(index)
    }

    /// The worker category that gets woken when work of this tier is queued.
    ///
    /// # Returns
    /// `None` for the main-thread tiers, which are only ever pumped by the main thread.
    pub fn worker_type(self) -> Option<WorkerThreadType> {
        use TaskPriority::*;

        match self {
            EarlyThisFrame | ThisFrame | LateThisFrame | EarlyNextFrame | NextFrame
            | LateNextFrame | In2Frames | In3Frames | In4Frames | In5Frames | In6Frames
            | In7Frames | In8Frames | In9Frames => Some(WorkerThreadType::ShortTasks),
            LongRunningHighPriority | LongRunning => Some(WorkerThreadType::LongTasks),
            FileAccessHighPriority | FileAccess => Some(WorkerThreadType::FileAccess),
            ThisFrameMainThread | SomeFrameMainThread => None,
        }
    }
}

/// The role of a thread from the scheduler's point of view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WorkerThreadType {
    /// A thread the scheduler knows nothing about.
    Unknown,
    /// The thread that created the task system. It never sleeps while waiting.
    MainThread,
    /// Pool serving the frame-relative tiers.
    ShortTasks,
    /// Pool serving the long running tiers.
    LongTasks,
    /// Pool serving the file access tiers.
    FileAccess,
}

impl WorkerThreadType {
    /// The categories that own a worker pool, in pool order.
    pub const POOLS: [WorkerThreadType; 3] = [
        WorkerThreadType::ShortTasks,
        WorkerThreadType::LongTasks,
        WorkerThreadType::FileAccess,
    ];

    /// Index of this category's worker pool, if it has one.
    pub fn pool_index(self) -> Option<usize> {
        match self {
            WorkerThreadType::ShortTasks => Some(0),
            WorkerThreadType::LongTasks => Some(1),
            WorkerThreadType::FileAccess => Some(2),
            WorkerThreadType::Unknown | WorkerThreadType::MainThread => None,
        }
    }

    /// The inclusive tier ranges a thread of this type takes work from, in the order they
    /// are searched.
    pub fn priority_ranges(self) -> &'static [(TaskPriority, TaskPriority)] {
        use TaskPriority::*;

        match self {
            WorkerThreadType::Unknown | WorkerThreadType::ShortTasks => {
                &[(EarlyThisFrame, In9Frames)]
            }
            WorkerThreadType::LongTasks => &[(LongRunningHighPriority, LongRunning)],
            WorkerThreadType::FileAccess => &[(FileAccessHighPriority, FileAccess)],
            WorkerThreadType::MainThread => &[
                (ThisFrameMainThread, ThisFrameMainThread),
                (EarlyThisFrame, In9Frames),
            ],
        }
    }
}

impl fmt::Display for WorkerThreadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerThreadType::Unknown => "unknown",
            WorkerThreadType::MainThread => "main",
            WorkerThreadType::ShortTasks => "short",
            WorkerThreadType::LongTasks => "long",
            WorkerThreadType::FileAccess => "file",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips_for_every_tier() {
        for index in 0..TaskPriority::COUNT {
            let priority = TaskPriority::from_index(index).unwrap();
            assert_eq!(priority.index(), index);
        }
        assert_eq!(TaskPriority::from_index(TaskPriority::COUNT), None);
        assert_eq!(TaskPriority::SomeFrameMainThread.index(), TaskPriority::COUNT - 1);
    }

    #[test]
    fn tiers_map_to_worker_categories() {
        assert_eq!(
            TaskPriority::LateThisFrame.worker_type(),
            Some(WorkerThreadType::ShortTasks)
        );
        assert_eq!(
            TaskPriority::In9Frames.worker_type(),
            Some(WorkerThreadType::ShortTasks)
        );
        assert_eq!(
            TaskPriority::LongRunning.worker_type(),
            Some(WorkerThreadType::LongTasks)
        );
        assert_eq!(
            TaskPriority::FileAccessHighPriority.worker_type(),
            Some(WorkerThreadType::FileAccess)
        );
        assert_eq!(TaskPriority::ThisFrameMainThread.worker_type(), None);
        assert_eq!(TaskPriority::SomeFrameMainThread.worker_type(), None);
    }

    #[test]
    fn pool_ranges_cover_their_own_tiers() {
        for pool in WorkerThreadType::POOLS {
            for index in 0..TaskPriority::COUNT {
                let priority = TaskPriority::from_index(index).unwrap();
                let served = pool
                    .priority_ranges()
                    .iter()
                    .any(|(first, last)| (*first..=*last).contains(&priority));
                assert_eq!(
                    served,
                    priority.worker_type() == Some(pool),
                    "{pool} / {priority:?}"
                );
            }
        }
    }
}
