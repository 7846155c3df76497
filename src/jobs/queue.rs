//! In-memory priority queue feeding the worker pool.
//!
//! Lower priority numbers run first; jobs of equal priority run in enqueue
//! order (FIFO). The durable `jobs` table is the source of truth; this queue
//! only holds ids and is rebuilt from the table on recovery.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq)]
struct QueuedEntry {
    priority: u8,
    enqueue_seq: u64,
    job_id: Uuid,
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the smallest (priority, seq)
        // pair surfaces first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueue_seq.cmp(&self.enqueue_seq))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct JobQueue {
    heap: Mutex<BinaryHeap<QueuedEntry>>,
    counter: AtomicU64,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job_id: Uuid, priority: u8) {
        let enqueue_seq = self.counter.fetch_add(1, Ordering::SeqCst);
        self.heap.lock().push(QueuedEntry {
            priority,
            enqueue_seq,
            job_id,
        });
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Uuid> {
        self.heap.lock().pop().map(|entry| entry.job_id)
    }

    /// Wait until a job is available.
    pub async fn pop_wait(&self) -> Uuid {
        loop {
            if let Some(job_id) = self.try_pop() {
                return job_id;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
