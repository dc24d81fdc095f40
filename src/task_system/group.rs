//! # Task Groups
//!
//! Groups live in a reusable arena of slots. A `TaskGroupId` is a (slot, generation) pair:
//! the slot's generation advances when the group finishes and again when the slot is handed
//! out to a new group, so a handle whose generation no longer matches its slot refers to a
//! group that has finished. No other liveness check exists.
//!
//! The slot itself (`GroupSlot`) only holds what is touched without the scheduler lock: the
//! generation and the two hot counters. Everything structural (`GroupData`) lives inside the
//! scheduler state and is only accessed with the global lock held.

use std::{
    fmt,
    sync::{
        atomic::{AtomicI32, AtomicU32, Ordering},
        Arc, Condvar, Mutex,
    },
};

use crate::core::lock;

use super::{priority::TaskPriority, task::SharedTask};

/// Callback invoked once when a group has finished, with the handle the group had.
pub type OnTaskGroupFinished = Box<dyn FnOnce(TaskGroupId) + Send>;

/// The lock-free part of one arena slot.
pub(crate) struct GroupSlot {
    pub(crate) index: usize,
    generation: AtomicU32,
    pub(crate) num_remaining_tasks: AtomicI32,
    pub(crate) num_active_dependencies: AtomicI32,
    finished_lock: Mutex<()>,
    finished: Condvar,
}

impl GroupSlot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            generation: AtomicU32::new(0),
            num_remaining_tasks: AtomicI32::new(0),
            num_active_dependencies: AtomicI32::new(0),
            finished_lock: Mutex::new(()),
            finished: Condvar::new(),
        }
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Hands the slot to a new group and returns the generation its handle carries.
    pub(crate) fn reuse(&self) -> u32 {
        self.num_remaining_tasks.store(0, Ordering::Release);
        self.num_active_dependencies.store(0, Ordering::Release);

        let _guard = lock(&self.finished_lock);
        self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Makes every handle of the current group stale.
    ///
    /// # Returns
    /// The generation the finished group's handles carry.
    pub(crate) fn mark_finished(&self) -> u32 {
        // Waiters check the generation under the same lock before sleeping.
        let _guard = lock(&self.finished_lock);
        self.generation.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn notify_finished(&self) {
        let _guard = lock(&self.finished_lock);
        self.finished.notify_all();
    }

    /// Blocks until the group with `generation` has finished.
    pub(crate) fn wait_for_finish(&self, generation: u32) {
        let guard = lock(&self.finished_lock);
        let _guard = self
            .finished
            .wait_while(guard, |_| self.generation() == generation)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

/// Handle to a task group.
///
/// Handles are cheap to clone and never keep a group alive. Once the group finishes the
/// handle stays "finished" forever, even after its slot has been reused.
#[derive(Clone, Default)]
pub struct TaskGroupId {
    slot: Option<Arc<GroupSlot>>,
    generation: u32,
}

impl TaskGroupId {
    pub(crate) fn new(slot: Arc<GroupSlot>, generation: u32) -> Self {
        Self {
            slot: Some(slot),
            generation,
        }
    }

    /// A handle that does not refer to any group. It always counts as finished.
    pub fn invalid() -> Self {
        Self::default()
    }

    /// `true` if this handle was handed out by `create_task_group`.
    pub fn is_valid(&self) -> bool {
        self.slot.is_some()
    }

    /// `true` once the group this handle refers to has finished.
    pub fn is_finished(&self) -> bool {
        match &self.slot {
            Some(slot) => slot.generation() != self.generation,
            None => true,
        }
    }

    /// Index of the arena slot, for diagnostics.
    pub fn slot_index(&self) -> Option<usize> {
        self.slot.as_ref().map(|slot| slot.index)
    }

    /// Generation the handle was created with, for diagnostics.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn slot(&self) -> Option<&Arc<GroupSlot>> {
        self.slot.as_ref()
    }

    /// `true` if this handle refers to the group currently occupying `slot`'s arena position.
    pub(crate) fn refers_to(&self, slot: &Arc<GroupSlot>) -> bool {
        self.slot.as_ref().is_some_and(|own| Arc::ptr_eq(own, slot))
    }
}

impl PartialEq for TaskGroupId {
    fn eq(&self, other: &Self) -> bool {
        let same_slot = match (&self.slot, &other.slot) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_slot && self.generation == other.generation
    }
}

impl Eq for TaskGroupId {}

impl fmt::Debug for TaskGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Some(slot) => write!(f, "TaskGroupId({}@{})", slot.index, self.generation),
            None => f.write_str("TaskGroupId(invalid)"),
        }
    }
}

/// One "group depends on group" edge, for batch insertion.
#[derive(Clone, Debug)]
pub struct TaskGroupDependency {
    /// The group that has to wait.
    pub task_group: TaskGroupId,
    /// The group it waits for.
    pub depends_on: TaskGroupId,
}

/// The structural part of one arena slot, guarded by the scheduler lock.
pub(crate) struct GroupData {
    pub(crate) slot: Arc<GroupSlot>,
    pub(crate) in_use: bool,
    pub(crate) started_by_user: bool,
    pub(crate) priority: TaskPriority,
    pub(crate) tasks: Vec<SharedTask>,
    pub(crate) depends_on: Vec<TaskGroupId>,
    pub(crate) others_depending_on_me: Vec<TaskGroupId>,
    pub(crate) on_finished: Option<OnTaskGroupFinished>,
}

impl GroupData {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            slot: Arc::new(GroupSlot::new(index)),
            in_use: false,
            started_by_user: false,
            priority: TaskPriority::ThisFrame,
            tasks: Vec::new(),
            depends_on: Vec::new(),
            others_depending_on_me: Vec::new(),
            on_finished: None,
        }
    }

    /// Resets the slot for a new group and returns that group's handle.
    pub(crate) fn reuse(
        &mut self,
        priority: TaskPriority,
        on_finished: Option<OnTaskGroupFinished>,
    ) -> TaskGroupId {
        self.in_use = true;
        self.started_by_user = false;
        self.priority = priority;
        self.tasks.clear();
        self.depends_on.clear();
        self.others_depending_on_me.clear();
        self.on_finished = on_finished;

        let generation = self.slot.reuse();
        TaskGroupId::new(self.slot.clone(), generation)
    }

    /// `true` if `id` still refers to the group occupying this slot.
    pub(crate) fn is_current(&self, id: &TaskGroupId) -> bool {
        id.refers_to(&self.slot) && !id.is_finished()
    }
}

/// One queued invocation of a task.
pub(crate) struct ScheduledTask {
    pub(crate) task: SharedTask,
    pub(crate) group: Arc<GroupSlot>,
    pub(crate) invocation: u32,
}
