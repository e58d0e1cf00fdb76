//! Blocking handles signalled by task finalisation.

use crate::pool;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// A single-shot handle for blocking until a task graph finishes.
///
/// A waitable is attached to a task through
/// [`TaskDesc::waitable`](crate::TaskDesc) (or a builder fence) and signalled
/// exactly once, when that task finalises. Dropping a waitable waits for the
/// signal, so destroying one whose task never finalises is a programming
/// error that blocks forever.
///
/// [`Self::wait`] may not be called from a pool worker thread: a worker
/// blocking on graph completion can deadlock the pool.
#[derive(Debug)]
pub struct Waitable {
    finished: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Waitable {
    /// Creates a new unsignalled waitable.
    pub fn new() -> Self {
        Self {
            finished: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Whether the waitable has been signalled.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until the waitable is signalled. Returns
    /// immediately if it already has been.
    ///
    /// # Panics
    /// If called from a pool worker thread.
    pub fn wait(&self) {
        if self.is_finished() {
            return;
        }

        assert!(
            !pool::is_worker_thread(),
            "Waiting on a waitable from a worker thread may deadlock the pool; \
             only the main thread may wait"
        );

        let mut guard = self.mutex.lock();
        while !self.finished.load(Ordering::Acquire) {
            self.condvar.wait(&mut guard);
        }
    }

    /// Signals the waitable, waking all waiting threads. Called by the
    /// scheduler when the associated task finalises.
    ///
    /// # Panics
    /// If the waitable has already been signalled.
    pub fn on_finished(&self) {
        let was_finished = self.finished.swap(true, Ordering::AcqRel);
        assert!(
            !was_finished,
            "A waitable may only be signalled once"
        );

        // Taking the mutex here keeps the notification from slipping in
        // between a waiter observing `finished == false` and it starting to
        // wait on the condition variable.
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

impl Drop for Waitable {
    fn drop(&mut self) {
        self.wait();
    }
}
