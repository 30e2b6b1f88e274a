//! # Work Queue
//!
//! A blocking FIFO shared between the download coordinator and the peer
//! workers. One instance carries pieces waiting to be downloaded, another
//! carries completed pieces back to the coordinator.
//!
//! The implementation is a `VecDeque` behind a mutex paired with a condition
//! variable: `pop` sleeps while the queue is empty, `push` appends and wakes
//! one sleeper. The queue has no capacity bound.
//!
//! Shutdown is explicit. Workers must not decide to exit just because the
//! queue looks empty, since a failed piece may be requeued a moment later by
//! another worker. Instead the coordinator calls [`WorkQueue::close`] once
//! every piece has been collected, which wakes all sleepers and makes `pop`
//! return `None` from then on.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new() -> WorkQueue<T> {
        WorkQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append an item and wake one waiting consumer.
    pub fn push(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        state.items.push_back(item);
        self.available.notify_one();
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue has been closed; items still queued at
    /// that point are dropped, closing means the download is over.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Mark the queue finished and wake every blocked consumer.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.available.notify_all();
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        WorkQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pops_in_fifo_order() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(WorkQueue::new());

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.push(7u32);
            })
        };

        // arrives before the push, must sleep and wake with the item
        assert_eq!(queue.pop(), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn close_wakes_blocked_consumers() {
        let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        queue.close();

        for consumer in consumers {
            assert_eq!(consumer.join().unwrap(), None);
        }
    }

    #[test]
    fn pop_after_close_returns_none() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.close();

        // leftovers are dropped once the queue is closed
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn requeued_items_go_to_the_back() {
        let queue = WorkQueue::new();
        queue.push("a");
        queue.push("b");

        let first = queue.pop().unwrap();
        queue.push(first);

        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("a"));
    }
}
