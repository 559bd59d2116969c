//! Priority Queue — a min-heap of `(score, TaskInstance)` pairs.
//!
//! Scanning order for scheduling iterates from lowest score; ties break on
//! insertion order (a monotonic sequence number), giving FIFO dispatch among
//! equally-scored tasks. `compute_score` defaults to `priority` with a
//! bounded age-based extension so long-queued tasks gain effective priority
//! without changing the documented external contract (`priority` remains the
//! sole input callers set).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

/// Recompute a task's scheduling score.
///
/// Lower scores are dispatched first. Defaults to `100 - priority` (so a
/// higher `priority` value is preferred) plus a bounded bonus for queue age,
/// capped so an old low-priority task can eventually outrank a fresh
/// high-priority one but never runs away unbounded.
pub fn compute_score(priority: i32, queued_at: i64, now: i64) -> i64 {
    let age_secs = (now - queued_at).max(0);
    let age_bonus = (age_secs / 30).min(50);
    (100 - priority as i64) - age_bonus
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Entry {
    score: i64,
    sequence: u64,
    task_id: i64,
}

// `BinaryHeap` is a max-heap; reverse the ordering on (score, sequence) so
// the smallest score (and, among ties, the earliest sequence) sorts first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
}

/// Min-heap of active `TaskInstance` ids ordered by score.
///
/// Holds no task data itself — it is an ordering index over ids; the
/// Scheduler Core looks up the actual `TaskInstance` by id to read its
/// `worker_requests` FIFO queue.
pub struct PriorityQueue {
    inner: Mutex<Inner>,
}

impl PriorityQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_sequence: 0,
            }),
        }
    }

    /// Insert `task_id` with `score`. Idempotent within a scheduling pass:
    /// if `task_id` is already present, its score is updated in place
    /// (duplicate detection by identity) rather than inserting a second
    /// entry.
    pub fn enqueue(&self, task_id: i64, score: i64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.heap.iter().any(|e| e.task_id == task_id) {
            inner.heap.retain(|e| e.task_id != task_id);
        }
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(Entry {
            score,
            sequence,
            task_id,
        });
    }

    /// Remove `task_id` if present. O(n) scan — acceptable at the expected
    /// queue size (tens to hundreds of active tasks).
    pub fn remove(&self, task_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.heap.retain(|e| e.task_id != task_id);
    }

    /// Return all task ids in ascending score order (lowest first), the
    /// scan order the Scheduler Core uses to find the first task with a
    /// non-empty `worker_requests` queue.
    pub fn scan_order(&self) -> Vec<i64> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<Entry> = inner.heap.iter().copied().collect();
        entries.sort_by(|a, b| a.score.cmp(&b.score).then(a.sequence.cmp(&b.sequence)));
        entries.into_iter().map(|e| e.task_id).collect()
    }

    /// Recompute every entry's score via `score_fn(task_id) -> Option<score>`.
    /// A `None` return removes the task (it no longer exists or is no
    /// longer active). Called on a periodic tick (every 5 seconds) so tasks
    /// gain effective priority by age.
    pub fn recompute_all(&self, score_fn: impl Fn(i64) -> Option<i64>) {
        let mut inner = self.inner.lock().unwrap();
        let old: Vec<Entry> = inner.heap.drain().collect();
        for entry in old {
            if let Some(score) = score_fn(entry.task_id) {
                inner.heap.push(Entry { score, ..entry });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn contains(&self, task_id: i64) -> bool {
        self.inner.lock().unwrap().heap.iter().any(|e| e.task_id == task_id)
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_order_is_ascending_by_score() {
        let q = PriorityQueue::new();
        q.enqueue(1, 50);
        q.enqueue(2, 10);
        q.enqueue(3, 30);
        assert_eq!(q.scan_order(), vec![2, 3, 1]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let q = PriorityQueue::new();
        q.enqueue(1, 10);
        q.enqueue(2, 10);
        q.enqueue(3, 10);
        assert_eq!(q.scan_order(), vec![1, 2, 3]);
    }

    #[test]
    fn enqueue_is_idempotent_by_identity() {
        let q = PriorityQueue::new();
        q.enqueue(1, 50);
        q.enqueue(1, 10);
        assert_eq!(q.len(), 1);
        assert_eq!(q.scan_order(), vec![1]);
    }

    #[test]
    fn remove_drops_entry() {
        let q = PriorityQueue::new();
        q.enqueue(1, 10);
        q.enqueue(2, 20);
        q.remove(1);
        assert_eq!(q.scan_order(), vec![2]);
        assert!(!q.contains(1));
    }

    #[test]
    fn recompute_all_rescales_and_can_drop_entries() {
        let q = PriorityQueue::new();
        q.enqueue(1, 50);
        q.enqueue(2, 10);
        q.recompute_all(|id| if id == 1 { Some(5) } else { None });
        assert_eq!(q.scan_order(), vec![1]);
    }

    #[test]
    fn compute_score_higher_priority_is_lower_score() {
        let high = compute_score(10, 0, 0);
        let low = compute_score(1, 0, 0);
        assert!(high < low);
    }

    #[test]
    fn compute_score_age_bonus_is_bounded() {
        let fresh = compute_score(5, 1_000_000, 1_000_000);
        let ancient = compute_score(5, 0, 1_000_000_000);
        assert!(ancient < fresh);
        assert_eq!(fresh - ancient, 50);
    }
}
