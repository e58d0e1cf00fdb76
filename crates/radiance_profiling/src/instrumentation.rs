//! Profiler hooks for the scheduler's lifecycle events.
//!
//! The scheduler reports three things to an external profiler: pool
//! construction ([`initialize`]), worker threads coming up
//! ([`register_worker_thread`]), and individual task executions
//! ([`task_execution_span`], labelled with the task's debug name). All hooks
//! compile to no-ops unless the `tracy` feature is enabled.

use std::fmt;

/// Starts the profiler client. Called once when a thread pool is
/// constructed; repeated calls are harmless.
#[cfg(feature = "tracy")]
pub fn initialize() {
    tracy_client::Client::start();
}

#[cfg(not(feature = "tracy"))]
#[inline]
pub fn initialize() {}

/// Announces a worker thread to the profiler under the given name, so that
/// task spans group per worker.
#[cfg(feature = "tracy")]
pub fn register_worker_thread(name: &str) {
    tracy_client::Client::running()
        .expect("Profiler not running when registering a worker thread")
        .set_thread_name(name);
}

#[cfg(not(feature = "tracy"))]
#[inline]
pub fn register_worker_thread(_name: &str) {}

/// Opens a profiler span covering one task execution, labelled with the
/// task's debug name. The span closes when the returned guard is dropped,
/// i.e. when the task routine returns.
#[cfg(feature = "tracy")]
pub fn task_execution_span(task_name: &str) -> TaskExecutionSpan {
    let span = tracy_client::Client::running()
        .expect("Profiler not running when opening a task span")
        .span_alloc(Some(task_name), "task", file!(), line!(), 0);
    TaskExecutionSpan { _span: span }
}

#[cfg(not(feature = "tracy"))]
#[inline]
pub fn task_execution_span(_task_name: &str) -> TaskExecutionSpan {
    TaskExecutionSpan {}
}

/// Guard for a task execution span; the span ends when this is dropped.
pub struct TaskExecutionSpan {
    #[cfg(feature = "tracy")]
    _span: tracy_client::Span,
}

impl fmt::Debug for TaskExecutionSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutionSpan").finish_non_exhaustive()
    }
}
