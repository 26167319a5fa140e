//! Unified priority queue feeding the dispatcher.
//!
//! The queue itself holds lightweight, cloneable tickets; the job of a
//! submission lives only in the task master's pending map. Promotion pushes
//! a second ticket for the same id, and the dispatcher discards tickets
//! whose id has already left the pending map, which makes dispatch
//! at-most-once by construction.
//!
//! Ticket ordering: promoted first, then higher priority, then submission
//! order (FIFO within equal priority).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::job::{Job, TaskKind};

/// Internal record of a submitted task, held in the pending map until the
/// dispatcher hands it to an executor.
#[derive(Debug)]
pub(crate) struct TaskSubmission {
    pub task_id: String,
    pub job: Job,
    pub kind: TaskKind,
    pub priority: i32,
    pub seq: u64,
    pub submitted_at: Instant,
    pub promoted: bool,
}

impl TaskSubmission {
    /// The queue ticket matching this submission's current state.
    pub fn ticket(&self) -> QueueTicket {
        QueueTicket {
            task_id: self.task_id.clone(),
            promoted: self.promoted,
            priority: self.priority,
            seq: self.seq,
        }
    }
}

/// Cloneable queue entry standing in for a pending submission.
#[derive(Debug, Clone)]
pub(crate) struct QueueTicket {
    pub task_id: String,
    pub promoted: bool,
    pub priority: i32,
    pub seq: u64,
}

impl Ord for QueueTicket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.promoted
            .cmp(&other.promoted)
            .then(self.priority.cmp(&other.priority))
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueTicket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueTicket {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueTicket {}

/// Thread-safe priority queue with a timed pop, so the dispatcher can
/// observe shutdown between submissions.
pub(crate) struct SubmissionQueue {
    heap: Mutex<BinaryHeap<QueueTicket>>,
    cond: Condvar,
    seq: AtomicU64,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Next submission sequence number (the FIFO tie-break).
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub fn push(&self, ticket: QueueTicket) {
        self.heap.lock().unwrap().push(ticket);
        self.cond.notify_one();
    }

    /// Pop the highest-ranked ticket, waiting up to `timeout` for one.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<QueueTicket> {
        let deadline = Instant::now() + timeout;
        let mut heap = self.heap.lock().unwrap();
        loop {
            if let Some(ticket) = heap.pop() {
                return Some(ticket);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cond.wait_timeout(heap, deadline - now).unwrap();
            heap = guard;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(id: &str, promoted: bool, priority: i32, seq: u64) -> QueueTicket {
        QueueTicket {
            task_id: id.to_string(),
            promoted,
            priority,
            seq,
        }
    }

    #[test]
    fn test_fifo_within_equal_priority() {
        let queue = SubmissionQueue::new();
        for i in 0..5 {
            let seq = queue.next_seq();
            queue.push(ticket(&format!("t{i}"), false, 0, seq));
        }
        for i in 0..5 {
            let popped = queue.pop_timeout(Duration::from_millis(10)).unwrap();
            assert_eq!(popped.task_id, format!("t{i}"));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_higher_priority_pops_first() {
        let queue = SubmissionQueue::new();
        queue.push(ticket("low", false, -1, queue.next_seq()));
        queue.push(ticket("normal", false, 0, queue.next_seq()));
        queue.push(ticket("high", false, 5, queue.next_seq()));

        let order: Vec<String> = (0..3)
            .map(|_| queue.pop_timeout(Duration::from_millis(10)).unwrap().task_id)
            .collect();
        assert_eq!(order, ["high", "normal", "low"]);
    }

    #[test]
    fn test_promoted_beats_priority() {
        let queue = SubmissionQueue::new();
        queue.push(ticket("urgent", false, 100, queue.next_seq()));
        queue.push(ticket("promoted", true, 0, queue.next_seq()));

        let first = queue.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(first.task_id, "promoted");
    }

    #[test]
    fn test_total_order_matches_comparison() {
        // Every popped pair must be ordered by (promoted, priority, seq).
        let queue = SubmissionQueue::new();
        let specs = [
            (false, 0),
            (true, -5),
            (false, 3),
            (false, 3),
            (true, 2),
            (false, -2),
        ];
        for (i, (promoted, priority)) in specs.iter().enumerate() {
            queue.push(ticket(&format!("t{i}"), *promoted, *priority, queue.next_seq()));
        }

        let mut popped = Vec::new();
        while let Some(t) = queue.pop_timeout(Duration::from_millis(5)) {
            popped.push(t);
        }
        assert_eq!(popped.len(), specs.len());
        for pair in popped.windows(2) {
            assert!(pair[0] >= pair[1], "{:?} popped before {:?}", pair[0], pair[1]);
        }
        assert!(popped[0].promoted);
        assert!(popped[1].promoted);
    }

    #[test]
    fn test_pop_timeout_on_empty_queue() {
        let queue = SubmissionQueue::new();
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_submission_ticket_reflects_promotion() {
        let submission = TaskSubmission {
            task_id: "abc".to_string(),
            job: Job::sync(|| Ok(crate::core::value::TaskValue::Null)),
            kind: TaskKind::Mixed,
            priority: 1,
            seq: 7,
            submitted_at: Instant::now(),
            promoted: false,
        };
        let before = submission.ticket();
        assert!(!before.promoted);

        let promoted = TaskSubmission {
            promoted: true,
            ..submission
        };
        let after = promoted.ticket();
        assert!(after.promoted);
        assert_eq!(after.seq, before.seq);
        assert!(after > before);
    }
}
