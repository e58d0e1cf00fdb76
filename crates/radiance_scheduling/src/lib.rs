//! Task-graph construction for the engine.
//!
//! [`TaskBuilder`] composes common parallelism patterns — independent tasks,
//! fences, parallel-for — into the underlying task graph of a
//! [`ThreadPool`](radiance_thread::ThreadPool). The [`parallel`] module
//! provides sorting algorithms expressed through the builder.

pub mod builder;
pub mod parallel;

pub use builder::{MAX_PENDING_TASKS, TaskBuilder};
pub use parallel::{parallel_sort, parallel_stable_sort};
