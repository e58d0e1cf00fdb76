//! Fluent construction of task graphs.

use radiance_containers::StaticVec;
use radiance_thread::{TaskContext, TaskDesc, TaskId, TaskPool, Waitable};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

/// Maximum number of unfenced tasks a [`TaskBuilder`] can hold.
pub const MAX_PENDING_TASKS: usize = 128;

/// A scoped helper for composing multiple tasks, fences and parallel-for
/// loops into the task graph of a [`TaskPool`].
///
/// Tasks pushed into the builder are created immediately but dispatched
/// lazily: a [`fence`](Self::fence) dispatches everything pushed before it,
/// and the builder's `Drop` dispatches everything that remains. Every task
/// pushed into a builder is therefore guaranteed to have been dispatched by
/// the end of the builder's scope.
///
/// A builder constructed with [`Self::with_waitable`] inserts a final fence
/// on scope exit that signals the waitable once all pushed tasks have
/// finalised. A builder constructed with [`Self::from_context`] parents all
/// pushed tasks to the running task, extending the structured fork-join tree
/// from inside a task routine.
pub struct TaskBuilder<'p> {
    pool: &'p TaskPool,
    waitable: Option<Arc<Waitable>>,
    parent: Option<TaskId>,
    /// The task that everything pushed after the last fence depends on.
    dependency: Option<TaskId>,
    /// Tasks created but not yet dispatched; flushed by the next fence or at
    /// scope exit.
    pending: StaticVec<TaskId, MAX_PENDING_TASKS>,
}

impl<'p> TaskBuilder<'p> {
    /// Creates a builder whose tasks have no parent.
    pub fn new(pool: &'p TaskPool) -> Self {
        Self {
            pool,
            waitable: None,
            parent: None,
            dependency: None,
            pending: StaticVec::new(),
        }
    }

    /// Creates a builder whose tasks become children of the given task.
    pub fn with_parent(pool: &'p TaskPool, parent: TaskId) -> Self {
        Self {
            pool,
            waitable: None,
            parent: Some(parent),
            dependency: None,
            pending: StaticVec::new(),
        }
    }

    /// Creates a builder inside a running task routine. Pushed tasks become
    /// children of the running task, so it finalises only after all of them.
    pub fn from_context(context: &TaskContext<'p>) -> Self {
        Self::with_parent(context.pool, context.task_id)
    }

    /// Creates a builder that signals the given waitable once every pushed
    /// task has finalised.
    pub fn with_waitable(pool: &'p TaskPool, waitable: Arc<Waitable>) -> Self {
        Self {
            pool,
            waitable: Some(waitable),
            parent: None,
            dependency: None,
            pending: StaticVec::new(),
        }
    }

    /// Pushes a new task executing the given routine.
    ///
    /// Tasks pushed between two fences may run in parallel with each other.
    pub fn task(
        &mut self,
        debug_name: &'static str,
        function: impl FnOnce(&TaskContext<'_>) + Send + 'static,
    ) {
        let mut desc = TaskDesc::with_function(function);
        desc.debug_name = Some(debug_name);
        desc.parent = self.parent;
        desc.dependency = self.dependency;

        self.pending.push(self.pool.create_task(desc));
    }

    /// Splices an externally created task into the graph: subsequent fences
    /// will wait for it like for any pushed task.
    ///
    /// The task must have been created but not yet dispatched; dispatching it
    /// remains the caller's responsibility.
    pub fn custom_task(&mut self, custom_task: TaskId) {
        let mut desc = TaskDesc::default();
        desc.debug_name = Some("TaskBuilder::custom_task");
        desc.parent = self.parent;
        desc.dependency = Some(custom_task);

        self.pending.push(self.pool.create_task(desc));
    }

    /// Pushes a parallel-for loop invoking `function` exactly once for every
    /// index in `[0, n_elements)`.
    ///
    /// The index range is subdivided into one stripe per sub-task, with one
    /// sub-task per worker (at most `n_elements`). Each sub-task claims
    /// indices from its own worker's stripe first and steals from the other
    /// stripes only once its own is drained, which biases iterations towards
    /// per-worker locality without giving up dynamic load balancing.
    pub fn parallel_for(
        &mut self,
        debug_name: &'static str,
        n_elements: u32,
        function: impl Fn(&TaskContext<'_>, u32) + Send + Sync + 'static,
    ) {
        if n_elements == 0 {
            return;
        }

        let mut desc = TaskDesc::default();
        desc.debug_name = Some(debug_name);
        desc.parent = self.parent;
        desc.dependency = self.dependency;

        let parallel_for_task = self.pool.create_task(desc);
        self.pending.push(parallel_for_task);

        let n_subtasks = n_elements.min(self.pool.n_workers() as u32);

        radiance_log::trace!(
            "Subdividing parallel-for \"{debug_name}\" over {n_elements} elements \
             into {n_subtasks} stripes"
        );

        let stripes: Arc<[WorkStripe]> = WorkStripe::subdivide(n_elements, n_subtasks).into();
        let function: Arc<dyn Fn(&TaskContext<'_>, u32) + Send + Sync> = Arc::new(function);

        for _ in 0..n_subtasks {
            let mut desc = TaskDesc::with_function({
                let stripes = Arc::clone(&stripes);
                let function = Arc::clone(&function);
                move |context: &TaskContext<'_>| {
                    let n_stripes = stripes.len() as u32;
                    let start = context.worker_id.index() as u32 % n_stripes;

                    // Walk the stripes cyclically, starting at this worker's
                    // own stripe.
                    for stripe_offset in 0..n_stripes {
                        let mut stripe_index = start + stripe_offset;
                        if stripe_index >= n_stripes {
                            stripe_index -= n_stripes;
                        }
                        let stripe = &stripes[stripe_index as usize];

                        loop {
                            let index = stripe.claimed.fetch_add(1, Ordering::Relaxed);
                            if index >= stripe.n_elements {
                                break;
                            }
                            function(context, stripe.offset + index);
                        }
                    }
                }
            });
            desc.debug_name = Some(debug_name);
            desc.parent = Some(parallel_for_task);
            desc.dependency = self.dependency;

            self.pool.create_and_dispatch_task(desc);
        }
    }

    /// Pushes a synchronisation point: every task pushed after the fence will
    /// start only once all tasks pushed before it have finalised.
    pub fn fence(&mut self) {
        self.fence_internal(None);
    }

    /// Like [`Self::fence`], but additionally signals the given waitable once
    /// all tasks pushed before the fence have finalised.
    pub fn fence_with(&mut self, waitable: Arc<Waitable>) {
        self.fence_internal(Some(waitable));
    }

    fn fence_internal(&mut self, waitable: Option<Arc<Waitable>>) {
        // Release the previous fence.
        if let Some(dependency) = self.dependency.take() {
            self.pool.dispatch_task(dependency);
        }

        let mut desc = TaskDesc::default();
        desc.debug_name = Some("TaskBuilder::fence");
        desc.waitable = waitable;
        let fence = self.pool.create_task(desc);

        // Give the fence one child per pending task so it can only finalise
        // after all of them, then release the pending tasks.
        for &pending in &self.pending {
            let mut desc = TaskDesc::default();
            desc.debug_name = Some("TaskBuilder::fence/sub");
            desc.parent = Some(fence);
            desc.dependency = Some(pending);
            self.pool.create_and_dispatch_task(desc);

            self.pool.dispatch_task(pending);
        }
        self.pending.clear();

        self.dependency = Some(fence);
    }
}

impl Drop for TaskBuilder<'_> {
    fn drop(&mut self) {
        if let Some(waitable) = self.waitable.take() {
            self.fence_with(waitable);
        }

        if let Some(dependency) = self.dependency.take() {
            self.pool.dispatch_task(dependency);
        }

        for &pending in &self.pending {
            self.pool.dispatch_task(pending);
        }
    }
}

impl fmt::Debug for TaskBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("parent", &self.parent)
            .field("dependency", &self.dependency)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// A contiguous subrange of a parallel-for index range, claimed index by
/// index by the sub-tasks. Aligned to a cache line so the claim counters of
/// different stripes do not false-share.
#[repr(align(64))]
struct WorkStripe {
    offset: u32,
    n_elements: u32,
    claimed: AtomicU32,
}

impl WorkStripe {
    /// Splits `n_elements` indices into `n_stripes` contiguous stripes with
    /// sizes differing by at most one.
    fn subdivide(n_elements: u32, n_stripes: u32) -> Vec<WorkStripe> {
        let mut stripes = Vec::with_capacity(n_stripes as usize);
        let mut offset = 0;

        for i in 0..n_stripes {
            let stripe_elements =
                n_elements / n_stripes + u32::from(n_elements % n_stripes > i);
            stripes.push(WorkStripe {
                offset,
                n_elements: stripe_elements,
                claimed: AtomicU32::new(0),
            });
            offset += stripe_elements;
        }

        stripes
    }
}
