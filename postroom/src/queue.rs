//! Thread-safe blocking double-ended queue.
//!
//! [`TsQueue`] is used twice in the framework: as each connection's private
//! outbound buffer, and as the endpoint-wide inbound mailbox shared by all
//! connections on one side. Producers push from I/O tasks; consumers drain
//! from whatever thread runs the application logic, optionally blocking in
//! [`TsQueue::wait_for_item`] until something arrives.
//!
//! The queue is unbounded. Flow control under backpressure is the caller's
//! responsibility.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// An unbounded thread-safe deque with a blocking wait primitive.
///
/// Popping an empty queue is a contract violation and panics; callers must
/// check [`TsQueue::is_empty`] or block in [`TsQueue::wait_for_item`] first.
#[derive(Debug)]
pub struct TsQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> TsQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panicked pusher cannot leave the deque inconsistent; keep going.
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item at the back, waking at most one waiter.
    pub fn push_back(&self, item: T) {
        self.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Insert an item at the front, waking at most one waiter.
    pub fn push_front(&self, item: T) {
        self.lock().push_front(item);
        self.ready.notify_one();
    }

    /// Remove and return the front item.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty.
    pub fn pop_front(&self) -> T {
        self.lock().pop_front().expect("pop_front on empty TsQueue")
    }

    /// Remove and return the back item.
    ///
    /// # Panics
    ///
    /// Panics if the queue is empty.
    pub fn pop_back(&self) -> T {
        self.lock().pop_back().expect("pop_back on empty TsQueue")
    }

    /// Whether the queue currently holds no items.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drop all queued items. Atomic with respect to concurrent push/pop.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Block the calling thread until the queue is non-empty.
    ///
    /// Emptiness is re-tested in a loop, so spurious condvar wakeups never
    /// leak out: when this returns, the queue held at least one item at the
    /// instant of the check.
    pub fn wait_for_item(&self) {
        let mut items = self.lock();
        while items.is_empty() {
            items = self
                .ready
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T: Clone> TsQueue<T> {
    /// Peek at the front item without removing it.
    pub fn front(&self) -> Option<T> {
        self.lock().front().cloned()
    }

    /// Peek at the back item without removing it.
    pub fn back(&self) -> Option<T> {
        self.lock().back().cloned()
    }
}

impl<T> Default for TsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_ordering() {
        let queue = TsQueue::new();
        queue.push_back(1);
        queue.push_back(2);
        queue.push_back(3);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front(), 1);
        assert_eq!(queue.pop_front(), 2);
        assert_eq!(queue.pop_front(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn push_front_and_pop_back() {
        let queue = TsQueue::new();
        queue.push_back(2);
        queue.push_front(1);
        queue.push_back(3);

        assert_eq!(queue.front(), Some(1));
        assert_eq!(queue.back(), Some(3));
        assert_eq!(queue.pop_back(), 3);
        assert_eq!(queue.pop_front(), 1);
    }

    #[test]
    fn clear_empties_the_queue() {
        let queue = TsQueue::new();
        for i in 0..10 {
            queue.push_back(i);
        }
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.front(), None::<i32>);
    }

    #[test]
    #[should_panic(expected = "pop_front on empty TsQueue")]
    fn pop_empty_is_fatal() {
        let queue: TsQueue<i32> = TsQueue::new();
        queue.pop_front();
    }

    #[test]
    fn wait_for_item_sees_concurrent_push() {
        let queue = Arc::new(TsQueue::new());
        let pusher = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.push_back(42);
            })
        };

        queue.wait_for_item();
        assert_eq!(queue.pop_front(), 42);
        pusher.join().expect("pusher panicked");
    }

    /// Single consumer draining what several producers push. A missed
    /// notification would leave the consumer stuck in `wait_for_item`.
    #[test]
    fn no_missed_notification_under_contention() {
        const PUSHERS: usize = 4;
        const PER_PUSHER: usize = 250;

        let queue = Arc::new(TsQueue::new());
        let producers: Vec<_> = (0..PUSHERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PUSHER {
                        queue.push_back(p * PER_PUSHER + i);
                    }
                })
            })
            .collect();

        let mut seen = 0;
        while seen < PUSHERS * PER_PUSHER {
            queue.wait_for_item();
            // Sole consumer: non-empty after wait implies pop succeeds.
            queue.pop_front();
            seen += 1;
        }

        for producer in producers {
            producer.join().expect("producer panicked");
        }
        assert!(queue.is_empty());
    }

    /// Every waiter parked in `wait_for_item` is eventually released when
    /// enough pushes arrive.
    #[test]
    fn each_push_releases_a_waiter() {
        const WAITERS: usize = 8;

        let queue = Arc::new(TsQueue::new());
        let waiters: Vec<_> = (0..WAITERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.wait_for_item())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        for i in 0..WAITERS {
            queue.push_back(i);
        }

        for waiter in waiters {
            waiter.join().expect("waiter panicked");
        }
        assert_eq!(queue.len(), WAITERS);
    }
}
