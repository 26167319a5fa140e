//! Completion primitive bridging executors and caller-facing handles.
//!
//! A [`CompletionSlot`] is a set-once cell with blocking, optionally timed
//! waits. The executor side completes (or cancels) it exactly once; any
//! number of handle clones may wait on it or peek at it. The slot stamps
//! the instant it was resolved so task durations stay stable after
//! completion.

use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::core::task::TaskException;
use crate::core::value::TaskValue;
use crate::error::{TaskmanError, TaskmanResult};

/// What a completed task realised: a value, or a failure value.
pub type TaskOutcome = Result<TaskValue, TaskException>;

/// Observable state of a slot.
#[derive(Debug, Clone)]
pub enum SlotState {
    /// Not resolved yet.
    Pending,
    /// Resolved with an outcome.
    Ready(TaskOutcome),
    /// Cancelled before resolving.
    Cancelled,
}

/// A set-once completion cell with blocking waits.
pub struct CompletionSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
    resolved_at: OnceLock<Instant>,
}

impl CompletionSlot {
    /// Create a pending slot.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            cond: Condvar::new(),
            resolved_at: OnceLock::new(),
        }
    }

    /// Resolve the slot with an outcome.
    ///
    /// Returns `false` if the slot was already resolved or cancelled.
    pub fn complete(&self, outcome: TaskOutcome) -> bool {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = SlotState::Ready(outcome);
        let _ = self.resolved_at.set(Instant::now());
        self.cond.notify_all();
        true
    }

    /// Cancel the slot.
    ///
    /// Returns `false` if the slot was already resolved or cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = SlotState::Cancelled;
        let _ = self.resolved_at.set(Instant::now());
        self.cond.notify_all();
        true
    }

    /// Whether the slot has been resolved or cancelled.
    pub fn is_done(&self) -> bool {
        !matches!(*self.state.lock().unwrap(), SlotState::Pending)
    }

    /// Whether the slot was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock().unwrap(), SlotState::Cancelled)
    }

    /// Non-blocking snapshot of the current state.
    pub fn snapshot(&self) -> SlotState {
        self.state.lock().unwrap().clone()
    }

    /// The instant the slot was resolved or cancelled.
    pub fn resolved_at(&self) -> Option<Instant> {
        self.resolved_at.get().copied()
    }

    /// Block until the slot resolves, up to `timeout` when given.
    ///
    /// A cancelled slot yields [`TaskmanError::Cancelled`]; an elapsed
    /// budget yields [`TaskmanError::Timeout`]. Outcomes are cloned, so
    /// repeated waits on a resolved slot keep returning the same outcome.
    pub fn wait(&self, timeout: Option<Duration>) -> TaskmanResult<TaskOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                SlotState::Ready(outcome) => return Ok(outcome.clone()),
                SlotState::Cancelled => return Err(TaskmanError::Cancelled),
                SlotState::Pending => {}
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TaskmanError::timeout(timeout.unwrap_or_default()));
                    }
                    let (guard, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
                    guard
                }
                None => self.cond.wait(state).unwrap(),
            };
        }
    }
}

impl Default for CompletionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompletionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSlot")
            .field("state", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_complete_is_set_once() {
        let slot = CompletionSlot::new();
        assert!(!slot.is_done());
        assert!(slot.complete(Ok(TaskValue::from(1))));
        assert!(!slot.complete(Ok(TaskValue::from(2))));
        assert!(!slot.cancel());

        let outcome = slot.wait(None).unwrap().unwrap();
        assert_eq!(outcome.as_i64(), Some(1));
        // A second wait returns the same realised outcome.
        let outcome = slot.wait(None).unwrap().unwrap();
        assert_eq!(outcome.as_i64(), Some(1));
    }

    #[test]
    fn test_cancel_surfaces_as_cancelled_error() {
        let slot = CompletionSlot::new();
        assert!(slot.cancel());
        assert!(slot.is_done());
        assert!(slot.is_cancelled());
        assert!(matches!(slot.wait(None), Err(TaskmanError::Cancelled)));
    }

    #[test]
    fn test_wait_times_out() {
        let slot = CompletionSlot::new();
        let err = slot.wait(Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());
        // The slot is still pending and can resolve afterwards.
        assert!(slot.complete(Ok(TaskValue::Null)));
        assert!(slot.wait(None).is_ok());
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let slot = Arc::new(CompletionSlot::new());
        let resolver = Arc::clone(&slot);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.complete(Ok(TaskValue::from("ping")));
        });
        let outcome = slot.wait(Some(Duration::from_secs(5))).unwrap().unwrap();
        assert_eq!(outcome.as_str(), Some("ping"));
        handle.join().unwrap();
    }

    #[test]
    fn test_resolution_instant_is_stable() {
        let slot = CompletionSlot::new();
        assert!(slot.resolved_at().is_none());
        slot.complete(Ok(TaskValue::Null));
        let first = slot.resolved_at().unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(slot.resolved_at().unwrap(), first);
    }
}
