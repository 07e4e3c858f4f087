//! Multi-producer queue with a blocking consumer side.

use crate::{SystemCondition, SystemMutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A queue guarded by a [`SystemMutex`] whose pushes raise a
/// [`SystemCondition`].
///
/// Any number of threads may push; the blocking calls are meant for a single
/// consumer. Because the condition is consumed by waits while items are
/// popped separately, a wake-up may find the queue empty; every blocking call
/// re-checks the queue before sleeping again.
#[derive(Debug)]
pub struct Mailbox<T> {
    queue: SystemMutex<VecDeque<T>>,
    ready: SystemCondition,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Mailbox {
            queue: SystemMutex::new(VecDeque::new()),
            ready: SystemCondition::new(),
        }
    }

    /// Append an item and wake the consumer.
    pub fn push(&self, item: T) {
        self.queue.lock().push_back(item);
        self.notify();
    }

    /// Wake the consumer without pushing anything.
    pub fn notify(&self) {
        self.ready.set_condition(true);
        self.ready.signal();
    }

    /// Pop the oldest item, if any, without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Take every queued item in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        self.queue.lock().drain(..).collect()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Pop the oldest item, blocking up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                return None;
            }
            if self.ready.timed_wait(remaining) {
                return self.try_pop();
            }
        }
    }

    /// Block until the mailbox is non-empty or [`notify`](Mailbox::notify)
    /// is called, for at most `timeout`. Items are left in the queue.
    ///
    /// Returns `true` if the wait timed out. A condition left raised by an
    /// earlier push can end the wait early; callers re-check their own state.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if !self.is_empty() {
            return false;
        }
        self.ready.timed_wait(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let mailbox = Mailbox::new();
        mailbox.push(1);
        mailbox.push(2);
        mailbox.push(3);
        assert_eq!(mailbox.len(), 3);
        assert_eq!(mailbox.try_pop(), Some(1));
        assert_eq!(mailbox.drain(), vec![2, 3]);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_pop_timeout_expires_on_empty() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        assert_eq!(mailbox.pop_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_pop_timeout_receives_from_other_thread() {
        let mailbox = Arc::new(Mailbox::new());
        let producer = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                mailbox.push("hello");
            })
        };
        assert_eq!(mailbox.pop_timeout(Duration::from_secs(10)), Some("hello"));
        producer.join().unwrap();
    }

    #[test]
    fn test_stale_wakeup_is_retried() {
        let mailbox = Mailbox::new();
        // Raises the condition, then the item is taken without waiting.
        mailbox.push(1);
        assert_eq!(mailbox.try_pop(), Some(1));
        // The leftover condition must not make pop_timeout return early.
        assert_eq!(mailbox.pop_timeout(Duration::from_millis(10)), None::<i32>);
    }

    #[test]
    fn test_wait_timeout_does_not_consume_items() {
        let mailbox = Mailbox::new();
        mailbox.push(7);
        assert!(!mailbox.wait_timeout(Duration::from_millis(1)));
        assert_eq!(mailbox.try_pop(), Some(7));
    }

    #[test]
    fn test_wait_timeout_on_idle_mailbox() {
        let mailbox: Mailbox<u8> = Mailbox::new();
        assert!(mailbox.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_notify_releases_waiter() {
        let mailbox: Arc<Mailbox<u8>> = Arc::new(Mailbox::new());
        let notifier = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                mailbox.notify();
            })
        };
        assert!(!mailbox.wait_timeout(Duration::from_secs(10)));
        notifier.join().unwrap();
    }
}
