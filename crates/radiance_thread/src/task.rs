//! Task records and descriptors.

use crate::{
    pool::{DEFAULT_PRIORITY, TaskPool},
    waitable::Waitable,
};
use bitflags::bitflags;
use std::{fmt, sync::Arc};

/// Identifier of a slot in the scheduler's task table.
///
/// IDs are dense indices into the table. They are *not* stable across reuse:
/// once a task finalises, its slot returns to the freelist and the same ID may
/// identify a different task. Holding on to an ID after dispatching the task
/// is therefore only meaningful for graph wiring that happens before the task
/// can finalise (e.g. adding dependents to a task that is known to be alive).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u32);

impl TaskId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ID identifying a worker thread in a [`ThreadPool`](crate::ThreadPool).
///
/// Worker IDs are dense in `[0, n_workers)` and stable for the lifetime of
/// the pool, so they can be used to index per-worker scratch storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WorkerId(pub(crate) u32);

impl WorkerId {
    /// Returns the ID as a dense index in `[0, n_workers)`.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type-erased task routine.
pub type TaskFunction = Box<dyn FnOnce(&TaskContext<'_>) + Send>;

/// Execution context passed to every task routine.
#[derive(Clone, Copy, Debug)]
pub struct TaskContext<'a> {
    /// The pool executing the task. Routines can use this to extend the task
    /// graph while it is running.
    pub pool: &'a TaskPool,
    /// The worker thread executing the task.
    pub worker_id: WorkerId,
    /// The ID of the executing task.
    pub task_id: TaskId,
}

/// Describes a task to be created with
/// [`TaskPool::create_task`](crate::TaskPool::create_task).
pub struct TaskDesc {
    /// The task routine. A task without a routine is a pure grouping or fence
    /// node that finalises without executing anything.
    pub function: Option<TaskFunction>,
    /// Waitable signalled when the task finalises.
    pub waitable: Option<Arc<Waitable>>,
    /// Parent task. The parent finalises only after this task (and all its
    /// other children) have finalised.
    pub parent: Option<TaskId>,
    /// Dependency task. This task will not execute before the dependency has
    /// finalised.
    pub dependency: Option<TaskId>,
    /// Target queue, in `[0, NUM_PRIORITIES)`. Tasks from lower-valued queues
    /// are always popped first.
    pub priority: u8,
    /// Identifier surfaced in diagnostics. Not consulted by the scheduler.
    pub debug_name: Option<&'static str>,
}

impl Default for TaskDesc {
    fn default() -> Self {
        Self {
            function: None,
            waitable: None,
            parent: None,
            dependency: None,
            priority: DEFAULT_PRIORITY,
            debug_name: None,
        }
    }
}

impl TaskDesc {
    /// Creates a descriptor for a task executing the given routine, with all
    /// other fields at their defaults.
    pub fn with_function(function: impl FnOnce(&TaskContext<'_>) + Send + 'static) -> Self {
        Self {
            function: Some(Box::new(function)),
            ..Self::default()
        }
    }
}

impl fmt::Debug for TaskDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDesc")
            .field("has_function", &self.function.is_some())
            .field("waitable", &self.waitable)
            .field("parent", &self.parent)
            .field("dependency", &self.dependency)
            .field("priority", &self.priority)
            .field("debug_name", &self.debug_name)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Unused task table entries.
    Invalid,
    /// Created task, not yet enqueueable.
    Created,
    /// Task with fulfilled dependency, waiting in a ready queue.
    Queued,
    /// Task being executed right now.
    Executing,
    Finished,
}

bitflags! {
    /// The two readiness flags gating enqueueing: a task enters a ready queue
    /// exactly when both flags become set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct DependencyState: u8 {
        const DISPATCHED = 1;
        const DEPENDENCY_FULFILLED = 1 << 1;
    }
}

/// A slot in the task table.
pub(crate) struct Task {
    pub(crate) callback: Option<TaskFunction>,
    pub(crate) state: TaskState,
    pub(crate) dependency_state: DependencyState,
    /// Number of completion contributions left (the task's own execution plus
    /// one per child). The task finalises when this reaches zero.
    pub(crate) tasks_left: i32,
    pub(crate) parent: Option<TaskId>,
    pub(crate) dependency: Option<TaskId>,
    /// First task in the intrusive list of tasks depending on this one.
    pub(crate) head: Option<TaskId>,
    /// Last task in the dependents list, for constant-time appends.
    pub(crate) tail: Option<TaskId>,
    /// Next task in the dependents list of this task's `dependency`.
    pub(crate) sibling: Option<TaskId>,
    pub(crate) waitable: Option<Arc<Waitable>>,
    pub(crate) priority: u8,
    pub(crate) debug_name: Option<&'static str>,
    /// Next slot in the freelist while this slot is unused.
    pub(crate) next_free: Option<TaskId>,
}

impl Task {
    pub(crate) fn new() -> Self {
        Self {
            callback: None,
            state: TaskState::Invalid,
            dependency_state: DependencyState::empty(),
            tasks_left: 0,
            parent: None,
            dependency: None,
            head: None,
            tail: None,
            sibling: None,
            waitable: None,
            priority: DEFAULT_PRIORITY,
            debug_name: None,
            next_free: None,
        }
    }

    /// Clears all fields except the state, which is managed exclusively
    /// through [`Self::swap_state`].
    pub(crate) fn reset(&mut self) {
        self.callback = None;
        self.dependency_state = DependencyState::empty();
        self.tasks_left = 0;
        self.parent = None;
        self.dependency = None;
        self.head = None;
        self.tail = None;
        self.sibling = None;
        self.waitable = None;
        self.priority = DEFAULT_PRIORITY;
        self.debug_name = None;
        self.next_free = None;
    }

    /// Replaces the state with `new` after verifying that the previous state
    /// is `expected`. Every legal state transition is a specific pair, so any
    /// mismatch means the task graph is corrupted.
    pub(crate) fn swap_state(&mut self, task_id: TaskId, expected: TaskState, new: TaskState) {
        assert!(
            self.state == expected,
            "Task {} ({}) is expected to be in {:?} state, found {:?}",
            task_id,
            self.display_name(),
            expected,
            self.state
        );
        self.state = new;
    }

    /// ORs the given flag into the dependency state and returns the previous
    /// state.
    pub(crate) fn set_dependency_flag(&mut self, flag: DependencyState) -> DependencyState {
        let old_state = self.dependency_state;
        self.dependency_state |= flag;
        old_state
    }

    pub(crate) fn display_name(&self) -> &'static str {
        self.debug_name.unwrap_or("unnamed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_desc_defaults_are_empty_with_default_priority() {
        let desc = TaskDesc::default();
        assert!(desc.function.is_none());
        assert!(desc.waitable.is_none());
        assert!(desc.parent.is_none());
        assert!(desc.dependency.is_none());
        assert!(desc.debug_name.is_none());
        assert_eq!(desc.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn setting_dependency_flags_accumulates_and_returns_previous_state() {
        let mut task = Task::new();

        let old_state = task.set_dependency_flag(DependencyState::DISPATCHED);
        assert_eq!(old_state, DependencyState::empty());

        let old_state = task.set_dependency_flag(DependencyState::DEPENDENCY_FULFILLED);
        assert_eq!(old_state, DependencyState::DISPATCHED);

        assert_eq!(task.dependency_state, DependencyState::all());
    }

    #[test]
    fn swapping_state_with_correct_expectation_works() {
        let mut task = Task::new();
        task.swap_state(TaskId(0), TaskState::Invalid, TaskState::Queued);
        assert_eq!(task.state, TaskState::Queued);
    }

    #[test]
    #[should_panic(expected = "expected to be in")]
    fn swapping_state_with_wrong_expectation_fails() {
        let mut task = Task::new();
        task.swap_state(TaskId(0), TaskState::Finished, TaskState::Invalid);
    }
}
