use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::task::{CategoryId, TaskPack};

/// A task tagged with the category it should be folded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub category: CategoryId,
    pub task: TaskPack,
}

impl QueueEntry {
    pub fn new(category: CategoryId, task: TaskPack) -> Self {
        Self { category, task }
    }
}

/// Handoff between producer threads and the single collector.
///
/// `put` may be called from any number of threads concurrently with each
/// other and with `try_pop`. Neither call blocks beyond a short critical
/// section. There is no capacity limit: under sustained overload the queue
/// grows rather than rejecting producers.
pub trait Queue: Send + Sync {
    /// Appends an entry. Never blocks, never rejects.
    fn put(&self, entry: QueueEntry);

    /// Removes and returns the oldest entry, if any.
    fn try_pop(&self) -> Option<QueueEntry>;

    /// Number of entries currently queued.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO queue guarded by a single mutex.
///
/// No condition variable: the collector polls on its own schedule.
#[derive(Debug, Default)]
pub struct MutexQueue {
    inner: Mutex<VecDeque<QueueEntry>>,
}

impl MutexQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue with room for `capacity` entries before reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }
}

impl Queue for MutexQueue {
    fn put(&self, entry: QueueEntry) {
        self.inner.lock().push_back(entry);
    }

    fn try_pop(&self) -> Option<QueueEntry> {
        self.inner.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = MutexQueue::new();
        for i in 0..5 {
            queue.put(QueueEntry::new(i, TaskPack::from_values([i * 10])));
        }

        for i in 0..5 {
            let entry = queue.try_pop().expect("entry present");
            assert_eq!(entry.category, i);
            assert_eq!(entry.task.get::<0>(), i * 10);
        }
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_empty_queue_pop_returns_none() {
        let queue = MutexQueue::with_capacity(8);
        assert!(queue.is_empty());
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_concurrent_put_loses_nothing() {
        const PRODUCERS: i32 = 8;
        const PER_PRODUCER: i32 = 1_000;

        let queue = Arc::new(MutexQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.put(QueueEntry::new(p, TaskPack::from_values([i])));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("producer thread");
        }

        assert_eq!(queue.len(), (PRODUCERS * PER_PRODUCER) as usize);

        // Per-producer order survives interleaving.
        let mut next_expected = vec![0; PRODUCERS as usize];
        while let Some(entry) = queue.try_pop() {
            let slot = &mut next_expected[entry.category as usize];
            assert_eq!(entry.task.get::<0>(), *slot);
            *slot += 1;
        }
        assert!(next_expected.iter().all(|&n| n == PER_PRODUCER));
    }
}
