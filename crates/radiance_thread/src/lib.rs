//! Task scheduling and worker threads for the engine.
//!
//! The scheduler executes a directed acyclic graph of tasks on a pool of
//! long-lived worker threads. Tasks are connected by two relations: a
//! *parent/child* relation (a parent finalises only after all its children)
//! and a *dependency* relation (a dependent does not start before its
//! dependency has finalised). [`Waitable`]s let the main thread block on
//! completion of a subgraph.
//!
//! See [`ThreadPool`] for the entry point, and the `radiance_scheduling`
//! crate for the fluent graph builder layered on top.

pub mod pool;
pub mod task;
pub mod waitable;

pub use pool::{
    DEFAULT_PRIORITY, DEFAULT_TASK_CAPACITY, MAX_PRIORITY, NUM_PRIORITIES, TaskPool, ThreadPool,
    ThreadPoolConfig,
};
pub use task::{TaskContext, TaskDesc, TaskFunction, TaskId, WorkerId};
pub use waitable::Waitable;
