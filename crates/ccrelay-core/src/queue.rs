//! Binary heap ordered by `(priority desc, enqueueSeq asc)` — the highest
//! priority, oldest-enqueued task pops first (spec §4.4).

use crate::task::Task;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry {
    priority: i64,
    enqueue_seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.enqueue_seq == other.enqueue_seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want highest priority first, and
        // among equal priorities the *oldest* (smallest enqueue_seq)
        // first, so reverse the seq comparison.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueue_seq.cmp(&self.enqueue_seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A priority queue of waiting Tasks. `O(log n)` push/pop; `remove` is
/// `O(n)` via rebuild, acceptable at the scale a single queue key's
/// waiters reach (bounded by `maxQueueSize`).
#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, task: Task) {
        self.heap.push(Entry {
            priority: task.priority,
            enqueue_seq: task.enqueue_seq,
            task,
        });
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|entry| entry.task)
    }

    pub fn size(&self) -> usize {
        self.heap.len()
    }

    pub fn peek(&self) -> Option<&Task> {
        self.heap.peek().map(|entry| &entry.task)
    }

    /// Remove a single waiting task by id, returning it if present.
    /// Rebuilds the heap in `O(n)`.
    pub fn remove(&mut self, task_id: u64) -> Option<Task> {
        let mut removed = None;
        let remaining: Vec<Entry> = self
            .heap
            .drain()
            .filter_map(|entry| {
                if removed.is_none() && entry.task.id == task_id {
                    removed = Some(entry.task);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        self.heap = remaining.into_iter().collect();
        removed
    }

    /// Drain all waiting tasks, in arbitrary order — the caller (queue
    /// clear, shutdown) fails every one identically regardless of order.
    pub fn drain(&mut self) -> Vec<Task> {
        self.heap.drain().map(|entry| entry.task).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
