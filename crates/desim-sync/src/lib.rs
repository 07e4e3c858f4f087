//! # desim-sync
//!
//! Blocking primitives used by the desim kernel.
//!
//! The pure single-threaded event loop never touches anything in this crate.
//! These types only come into play when a second thread injects events into
//! an engine (real-time pacing, external drivers) or when ranks of a
//! distributed run exchange messages in-process.
//!
//! - [`SystemMutex`] / [`CriticalSection`] - scoped mutual exclusion
//! - [`SystemCondition`] - condition flag with consume-on-wait semantics
//! - [`Mailbox`] - mutex-guarded queue that signals a condition on push
//! - [`Barrier`] - all-parties rendezvous with timeout

mod barrier;
mod mailbox;

pub use barrier::{Barrier, BarrierTimeout};
pub use mailbox::Mailbox;

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

// ============================================================================
// Mutex
// ============================================================================

/// Guard returned by [`SystemMutex::lock`]. The lock is released when the
/// guard goes out of scope, on every exit path.
pub type CriticalSection<'a, T = ()> = MutexGuard<'a, T>;

/// Mutual exclusion around a value (or around nothing, for plain critical
/// sections).
#[derive(Debug, Default)]
pub struct SystemMutex<T = ()> {
    inner: Mutex<T>,
}

impl<T> SystemMutex<T> {
    /// Create a new mutex guarding `value`.
    pub fn new(value: T) -> Self {
        SystemMutex {
            inner: Mutex::new(value),
        }
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) -> CriticalSection<'_, T> {
        self.inner.lock()
    }

    /// Acquire the lock if it is free.
    pub fn try_lock(&self) -> Option<CriticalSection<'_, T>> {
        self.inner.try_lock()
    }

    /// Access the value without locking; exclusive borrow proves no one else holds it.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consume the mutex, returning the guarded value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

// ============================================================================
// Condition
// ============================================================================

/// A boolean condition plus a condition variable.
///
/// [`wait`](SystemCondition::wait) blocks until the condition is true and then
/// resets it to false, so each `set_condition(true)` releases one waiter's
/// wait. [`signal`](SystemCondition::signal) and
/// [`broadcast`](SystemCondition::broadcast) only wake threads; a woken thread
/// that finds the condition still false goes back to sleep.
#[derive(Debug, Default)]
pub struct SystemCondition {
    condition: Mutex<bool>,
    cond_var: Condvar,
}

impl SystemCondition {
    /// Create a condition that starts out false.
    pub fn new() -> Self {
        SystemCondition {
            condition: Mutex::new(false),
            cond_var: Condvar::new(),
        }
    }

    /// Set the condition value.
    pub fn set_condition(&self, value: bool) {
        *self.condition.lock() = value;
    }

    /// Current condition value.
    pub fn condition(&self) -> bool {
        *self.condition.lock()
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        let _guard = self.condition.lock();
        self.cond_var.notify_one();
    }

    /// Wake all waiters.
    pub fn broadcast(&self) {
        let _guard = self.condition.lock();
        self.cond_var.notify_all();
    }

    /// Block until the condition is true, then reset it to false.
    pub fn wait(&self) {
        let mut condition = self.condition.lock();
        while !*condition {
            self.cond_var.wait(&mut condition);
        }
        *condition = false;
    }

    /// Like [`wait`](SystemCondition::wait) but gives up after `timeout`.
    ///
    /// Returns `true` if the wait timed out with the condition still false.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut condition = self.condition.lock();
        while !*condition {
            match deadline {
                Some(deadline) => {
                    if self
                        .cond_var
                        .wait_until(&mut condition, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.cond_var.wait(&mut condition),
            }
        }

        if *condition {
            *condition = false;
            false
        } else {
            true
        }
    }
}
