//! Thread pool and task scheduler implementation.

use crate::task::{DependencyState, Task, TaskContext, TaskDesc, TaskId, TaskState, WorkerId};
use anyhow::{Context as _, Result, ensure};
use parking_lot::{Condvar, Mutex};
use radiance_containers::FixedQueue;
use radiance_profiling::instrumentation;
use std::{
    cell::Cell,
    fmt,
    num::NonZeroUsize,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

/// Number of task priority levels. Priority 0 is served first.
pub const NUM_PRIORITIES: usize = 3;

/// Largest valid priority value (the least urgent queue).
pub const MAX_PRIORITY: u8 = (NUM_PRIORITIES - 1) as u8;

/// Priority assigned to tasks that do not specify one.
pub const DEFAULT_PRIORITY: u8 = 1;

/// Default number of slots in the task table.
pub const DEFAULT_TASK_CAPACITY: u32 = 1 << 17;

static GLOBAL_POOL: LazyLock<ThreadPool> = LazyLock::new(ThreadPool::new);

thread_local! {
    static IS_WORKER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is a worker thread of some [`ThreadPool`].
pub(crate) fn is_worker_thread() -> bool {
    IS_WORKER_THREAD.get()
}

/// Configuration for constructing a [`ThreadPool`].
#[derive(Clone, Debug)]
pub struct ThreadPoolConfig {
    /// Number of worker threads, or `None` to use the hardware concurrency.
    pub n_workers: Option<NonZeroUsize>,
    /// Number of slots in the task table. The table never grows; a graph
    /// exceeding this many simultaneously live tasks is a fatal error.
    pub task_capacity: u32,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            n_workers: None,
            task_capacity: DEFAULT_TASK_CAPACITY,
        }
    }
}

/// A pool of worker threads executing a graph of dependency-tracked,
/// priority-ordered tasks.
///
/// Tasks are created against a fixed-capacity task table and become runnable
/// once they have been dispatched *and* their dependency (if any) has
/// finalised. A task finalises when its own routine and all tasks parented to
/// it have completed, at which point its [`Waitable`](crate::Waitable) (if
/// any) is signalled and its slot is recycled.
///
/// # Examples
/// ```
/// # use radiance_thread::{TaskDesc, ThreadPool, Waitable};
/// # use std::sync::{
/// #     Arc,
/// #     atomic::{AtomicU32, Ordering},
/// # };
/// #
/// let pool = ThreadPool::new();
///
/// let counter = Arc::new(AtomicU32::new(0));
/// let waitable = Arc::new(Waitable::new());
///
/// let mut desc = TaskDesc::with_function({
///     let counter = Arc::clone(&counter);
///     move |_context| {
///         counter.fetch_add(1, Ordering::Relaxed);
///     }
/// });
/// desc.waitable = Some(Arc::clone(&waitable));
///
/// pool.create_and_dispatch_task(desc);
///
/// waitable.wait();
/// assert_eq!(counter.load(Ordering::Relaxed), 1);
/// ```
#[derive(Debug)]
pub struct ThreadPool {
    pool: Arc<TaskPool>,
    workers: Vec<Worker>,
}

/// The scheduling state shared between a [`ThreadPool`], its worker threads
/// and the [`TaskContext`]s handed to task routines.
pub struct TaskPool {
    /// Task table, freelist and dependency linkage.
    task_list: Mutex<TaskList>,
    /// Per-priority FIFO queues of dispatchable tasks. When both scheduler
    /// locks are needed, `task_list` is always taken first.
    ready_queues: Mutex<ReadyQueues>,
    /// Signalled whenever a task is pushed onto a ready queue.
    task_available: Condvar,
    n_workers: usize,
}

struct TaskList {
    tasks: Box<[Task]>,
    first_free: Option<TaskId>,
}

struct ReadyQueues {
    queues: [FixedQueue<TaskId>; NUM_PRIORITIES],
}

#[derive(Debug)]
struct Worker {
    handle: JoinHandle<()>,
    /// Cleared (under the ready-queue lock) to make the worker exit its
    /// scheduling loop.
    started: Arc<AtomicBool>,
}

impl ThreadPool {
    /// Creates a new thread pool with the default configuration: one worker
    /// per hardware thread and the default task capacity.
    ///
    /// # Panics
    /// If worker threads cannot be spawned.
    pub fn new() -> Self {
        Self::with_config(ThreadPoolConfig::default()).expect("Failed to create thread pool")
    }

    /// Creates a new thread pool with the given configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a worker thread
    /// could not be spawned.
    pub fn with_config(config: ThreadPoolConfig) -> Result<Self> {
        ensure!(config.task_capacity > 0, "Task capacity must be nonzero");

        let n_workers = match config.n_workers {
            Some(n_workers) => n_workers.get(),
            None => thread::available_parallelism()
                .context("Could not determine hardware concurrency")?
                .get(),
        };

        instrumentation::initialize();

        let pool = Arc::new(TaskPool::new(config.task_capacity, n_workers));

        let workers = (0..n_workers as u32)
            .map(|id| Worker::spawn(Arc::clone(&pool), WorkerId(id)))
            .collect::<Result<Vec<_>>>()?;

        radiance_log::debug!(
            "Created thread pool with {} workers and {} task slots",
            n_workers,
            config.task_capacity
        );

        Ok(Self { pool, workers })
    }

    /// Returns the process-wide thread pool, creating it on first use. The
    /// pool lives until the process exits.
    pub fn global() -> &'static ThreadPool {
        &GLOBAL_POOL
    }

    /// Returns the shared [`TaskPool`] driving this thread pool.
    pub fn task_pool(&self) -> &TaskPool {
        &self.pool
    }

    /// Returns the number of worker threads in the pool (this does not
    /// include the main thread).
    pub fn n_workers(&self) -> usize {
        self.pool.n_workers()
    }

    /// See [`TaskPool::create_task`].
    pub fn create_task(&self, desc: TaskDesc) -> TaskId {
        self.pool.create_task(desc)
    }

    /// See [`TaskPool::dispatch_task`].
    pub fn dispatch_task(&self, task_id: TaskId) {
        self.pool.dispatch_task(task_id);
    }

    /// See [`TaskPool::create_and_dispatch_task`].
    pub fn create_and_dispatch_task(&self, desc: TaskDesc) {
        self.pool.create_and_dispatch_task(desc);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let _guard = self.pool.ready_queues.lock();

            for worker in &self.workers {
                worker.started.store(false, Ordering::Release);
            }

            self.pool.task_available.notify_all();
        }

        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

impl TaskPool {
    fn new(task_capacity: u32, n_workers: usize) -> Self {
        Self {
            task_list: Mutex::new(TaskList::new(task_capacity)),
            ready_queues: Mutex::new(ReadyQueues::new(task_capacity as usize)),
            task_available: Condvar::new(),
            n_workers,
        }
    }

    /// Returns the number of worker threads serving this pool.
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Creates a new task without enqueueing it; the task cannot execute
    /// before [`Self::dispatch_task`] is called for it, even if its
    /// dependency is already fulfilled.
    ///
    /// This function is thread-safe.
    ///
    /// # Panics
    /// If the priority is out of range, the task table is exhausted, or the
    /// given dependency task is not alive.
    pub fn create_task(&self, desc: TaskDesc) -> TaskId {
        assert!(
            desc.priority <= MAX_PRIORITY,
            "Invalid task priority {} (valid range is 0..={})",
            desc.priority,
            MAX_PRIORITY
        );

        let mut list = self.task_list.lock();

        let task_id = list.allocate();

        {
            let task = list.task_mut(task_id);
            task.reset();
            task.callback = desc.function;
            task.waitable = desc.waitable;
            task.parent = desc.parent;
            task.dependency = desc.dependency;
            task.priority = desc.priority;
            task.debug_name = desc.debug_name;
            task.tasks_left = 1;
            task.swap_state(task_id, TaskState::Queued, TaskState::Created);
        }

        if let Some(parent_id) = desc.parent {
            list.task_mut(parent_id).tasks_left += 1;
        }

        let mut dependency_fulfilled = true;

        if let Some(dependency_id) = desc.dependency {
            let (dependency_state, dependency_tasks_left, dependency_tail) = {
                let dependency = list.task(dependency_id);
                (dependency.state, dependency.tasks_left, dependency.tail)
            };

            assert!(
                dependency_state != TaskState::Invalid,
                "Task {} ({}) depends on task {} which is not alive",
                task_id,
                desc.debug_name.unwrap_or("unnamed"),
                dependency_id
            );

            if dependency_tasks_left > 0 {
                // Append to the dependency's list of dependents.
                match dependency_tail {
                    Some(tail_id) => list.task_mut(tail_id).sibling = Some(task_id),
                    None => list.task_mut(dependency_id).head = Some(task_id),
                }
                list.task_mut(dependency_id).tail = Some(task_id);

                dependency_fulfilled = false;
            }
        }

        if dependency_fulfilled {
            list.task_mut(task_id).dependency_state = DependencyState::DEPENDENCY_FULFILLED;
        }

        task_id
    }

    /// Publishes a created task for execution. The task is enqueued
    /// immediately if its dependency is already fulfilled, and by the
    /// dependency's completion cascade otherwise.
    ///
    /// Using the task ID after dispatching is undefined: the task may run and
    /// have its slot recycled at any point.
    ///
    /// This function is thread-safe.
    ///
    /// # Panics
    /// If the task has already been dispatched.
    pub fn dispatch_task(&self, task_id: TaskId) {
        let mut list = self.task_list.lock();

        let old_state = {
            let task = list.task_mut(task_id);
            assert!(
                task.state == TaskState::Created,
                "Task {} ({}) must be in Created state to be dispatched, found {:?}",
                task_id,
                task.display_name(),
                task.state
            );
            task.set_dependency_flag(DependencyState::DISPATCHED)
        };

        assert!(
            !old_state.contains(DependencyState::DISPATCHED),
            "Task {task_id} dispatched twice"
        );

        // Enqueue only if the dependency was already fulfilled; otherwise the
        // completion cascade of the dependency performs the enqueue.
        if old_state == DependencyState::DEPENDENCY_FULFILLED {
            self.enqueue(&mut list, task_id);
        }
    }

    /// Creates a task and dispatches it right away.
    pub fn create_and_dispatch_task(&self, desc: TaskDesc) {
        let task_id = self.create_task(desc);
        self.dispatch_task(task_id);
    }

    /// Marks the dependency of the given task as fulfilled, enqueueing the
    /// task if it has also been dispatched. Runs under the task-list lock as
    /// part of the completion cascade.
    fn fulfil_dependency(&self, list: &mut TaskList, task_id: TaskId) {
        let old_state = {
            let task = list.task_mut(task_id);
            assert!(
                task.dependency.is_some(),
                "Task {} ({}) is in a dependents list but has no dependency",
                task_id,
                task.display_name()
            );
            assert!(
                task.state == TaskState::Created,
                "Task {} ({}) is expected to be in Created state while awaiting \
                 its dependency, found {:?}",
                task_id,
                task.display_name(),
                task.state
            );
            task.set_dependency_flag(DependencyState::DEPENDENCY_FULFILLED)
        };

        assert!(
            !old_state.contains(DependencyState::DEPENDENCY_FULFILLED),
            "Dependency of task {task_id} fulfilled twice"
        );

        if old_state == DependencyState::DISPATCHED {
            self.enqueue(list, task_id);
        }
    }

    /// Transitions the task to `Queued` and pushes it onto its priority
    /// queue. Takes the ready-queue lock nested inside the task-list lock;
    /// no code path takes the two locks in the reverse order.
    fn enqueue(&self, list: &mut TaskList, task_id: TaskId) {
        let priority = {
            let task = list.task_mut(task_id);
            task.swap_state(task_id, TaskState::Created, TaskState::Queued);
            assert!(
                task.dependency_state == DependencyState::all(),
                "Task {} ({}) enqueued with incomplete dependency state",
                task_id,
                task.display_name()
            );
            task.priority
        };

        let mut queues = self.ready_queues.lock();
        queues.push(priority, task_id);
        self.task_available.notify_all();
    }

    /// The scheduling loop run by every worker thread.
    fn run_worker(&self, worker_id: WorkerId, started: &AtomicBool) {
        loop {
            let task_id = {
                let mut queues = self.ready_queues.lock();
                loop {
                    if !started.load(Ordering::Acquire) {
                        return;
                    }
                    if let Some(task_id) = queues.pop_next() {
                        break task_id;
                    }
                    self.task_available.wait(&mut queues);
                }
            };

            self.execute_task(worker_id, task_id);
        }
    }

    fn execute_task(&self, worker_id: WorkerId, task_id: TaskId) {
        let (callback, task_name) = {
            let mut list = self.task_list.lock();
            let task = list.task_mut(task_id);
            let callback = task.callback.take();
            let task_name = task.display_name();
            if callback.is_some() {
                task.swap_state(task_id, TaskState::Queued, TaskState::Executing);
            } else {
                // A task without a routine is a pure grouping or fence node.
                task.swap_state(task_id, TaskState::Queued, TaskState::Finished);
            }
            (callback, task_name)
        };

        if let Some(callback) = callback {
            let context = TaskContext {
                pool: self,
                worker_id,
                task_id,
            };

            radiance_log::trace!("Worker {worker_id} executing task {task_id} ({task_name})");
            let start_time = Instant::now();

            // The routine runs outside all scheduler locks.
            {
                let _span = instrumentation::task_execution_span(task_name);
                callback(&context);
            }

            radiance_log::trace!(
                "Worker {worker_id} finished task {task_id} ({task_name}) in {:.2} ms",
                start_time.elapsed().as_secs_f64() * 1e3
            );

            self.task_list.lock().task_mut(task_id).swap_state(
                task_id,
                TaskState::Executing,
                TaskState::Finished,
            );
        }

        self.finish_task(task_id);
    }

    /// The completion cascade: decrements the outstanding-completion counter
    /// of the given finished task and, when it reaches zero, resolves
    /// dependents, recycles the slot, signals the waitable and continues with
    /// the parent.
    ///
    /// Implemented as a loop rather than recursion so the stack stays bounded
    /// on long parent chains.
    fn finish_task(&self, task_id: TaskId) {
        let mut task_to_finish = Some(task_id);

        while let Some(task_id) = task_to_finish {
            let parent;
            let waitable;

            {
                let mut list = self.task_list.lock();

                let tasks_left = {
                    let task = list.task_mut(task_id);
                    task.tasks_left -= 1;
                    assert!(
                        task.tasks_left >= 0,
                        "Completion counter of task {} ({}) underflowed",
                        task_id,
                        task.display_name()
                    );
                    task.tasks_left
                };

                if tasks_left > 0 {
                    // Children are still outstanding.
                    return;
                }

                {
                    let task = list.task_mut(task_id);
                    parent = task.parent;
                    waitable = task.waitable.take();
                }

                // Resolve every task that depends on this one.
                let mut dependent = list.task(task_id).head;
                while let Some(dependent_id) = dependent {
                    self.fulfil_dependency(&mut list, dependent_id);
                    dependent = list.task(dependent_id).sibling;
                }

                list.free(task_id);
            }

            // Signalled outside the task-list lock so woken waiters cannot
            // contend with the rest of the cascade.
            if let Some(waitable) = waitable {
                waitable.on_finished();
            }

            task_to_finish = parent;
        }
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("n_workers", &self.n_workers)
            .finish_non_exhaustive()
    }
}

impl TaskList {
    fn new(capacity: u32) -> Self {
        let mut tasks = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            let mut task = Task::new();
            task.next_free = if i + 1 < capacity {
                Some(TaskId(i + 1))
            } else {
                None
            };
            tasks.push(task);
        }

        Self {
            tasks: tasks.into_boxed_slice(),
            first_free: Some(TaskId(0)),
        }
    }

    fn task(&self, task_id: TaskId) -> &Task {
        &self.tasks[task_id.index()]
    }

    fn task_mut(&mut self, task_id: TaskId) -> &mut Task {
        &mut self.tasks[task_id.index()]
    }

    /// Pops a slot off the freelist. Exhaustion is fatal: the table is sized
    /// for peak load and cannot grow.
    fn allocate(&mut self) -> TaskId {
        let task_id = self
            .first_free
            .expect("Task table exhausted; increase the pool's task capacity");

        let next_free = {
            let task = self.task_mut(task_id);
            task.swap_state(task_id, TaskState::Invalid, TaskState::Queued);
            task.next_free
        };

        self.first_free = next_free;
        task_id
    }

    /// Returns a finished task's slot to the freelist.
    fn free(&mut self, task_id: TaskId) {
        let first_free = self.first_free;

        let task = self.task_mut(task_id);
        task.swap_state(task_id, TaskState::Finished, TaskState::Invalid);
        task.next_free = first_free;

        self.first_free = Some(task_id);
    }
}

impl ReadyQueues {
    fn new(capacity: usize) -> Self {
        Self {
            queues: std::array::from_fn(|_| FixedQueue::new(capacity)),
        }
    }

    fn push(&mut self, priority: u8, task_id: TaskId) {
        self.queues[priority as usize].push_back(task_id);
    }

    /// Pops from the most urgent non-empty queue.
    fn pop_next(&mut self) -> Option<TaskId> {
        self.queues.iter_mut().find_map(FixedQueue::pop_front)
    }
}

impl Worker {
    /// Spawns a new worker thread running the pool's scheduling loop.
    fn spawn(pool: Arc<TaskPool>, worker_id: WorkerId) -> Result<Self> {
        let started = Arc::new(AtomicBool::new(true));

        let thread_name = format!("radiance worker #{worker_id}");

        let handle = {
            let started = Arc::clone(&started);
            thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    IS_WORKER_THREAD.set(true);
                    instrumentation::register_worker_thread(&thread_name);
                    radiance_log::trace!("Worker {worker_id} spawned");

                    pool.run_worker(worker_id, &started);

                    radiance_log::trace!("Worker {worker_id} terminating");
                })
                .with_context(|| format!("Failed to spawn worker thread {worker_id}"))?
        };

        Ok(Self { handle, started })
    }

    fn join(self) {
        if let Err(err) = self.handle.join() {
            radiance_log::error!("Worker thread failed to join: {err:?}");
        }
    }
}

#[cfg(test)]
impl TaskPool {
    pub(crate) fn task_capacity(&self) -> usize {
        self.task_list.lock().tasks.len()
    }

    pub(crate) fn free_slot_count(&self) -> usize {
        let list = self.task_list.lock();
        let mut count = 0;
        let mut next = list.first_free;
        while let Some(task_id) = next {
            count += 1;
            next = list.task(task_id).next_free;
        }
        count
    }
}
