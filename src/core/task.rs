//! Caller-facing task handles.
//!
//! A [`Task`] wraps the completion slot of a single submission. Handles
//! produced by the smart path additionally carry the task id and a
//! reference back to the task master, which is what enables result-cache
//! draining and promotion-on-wait: asking for a result is a signal that
//! the caller is now blocked, so the pending submission is moved ahead of
//! unpromoted work.
//!
//! [`Tasks`] aggregates many handles with ordered, successful-only,
//! fail-fast and completion-order retrieval variants.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::error;
use serde::{Deserialize, Serialize};

use crate::core::completion::{CompletionSlot, SlotState, TaskOutcome};
use crate::core::master::TaskMaster;
use crate::core::value::TaskValue;
use crate::error::{TaskmanError, TaskmanResult};

/// Serialisable wrapper around a task failure.
///
/// Carries a message and a stable kind name, and — when the failure
/// originated in-process — the original error. Failures are cached as
/// values, exactly like successes, so the original error is not part of
/// the serialised form.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskException {
    message: String,
    kind: String,
    #[serde(skip)]
    original: Option<Arc<anyhow::Error>>,
}

impl TaskException {
    /// Create an exception value from a kind name and message.
    pub fn new<K: Into<String>, M: Into<String>>(kind: K, message: M) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            original: None,
        }
    }

    /// Wrap an error returned by a job.
    ///
    /// Engine errors keep their variant kind; anything else is a plain
    /// `TaskError`.
    pub fn from_error(error: anyhow::Error) -> Self {
        if let Some(exception) = error.downcast_ref::<TaskException>() {
            return exception.clone();
        }
        let kind = error
            .downcast_ref::<TaskmanError>()
            .map(TaskmanError::kind)
            .unwrap_or("TaskError")
            .to_string();
        Self {
            message: error.to_string(),
            kind,
            original: Some(Arc::new(error)),
        }
    }

    /// Wrap a panic payload caught inside a worker.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "task panicked".to_string());
        Self::new("Panic", message)
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The stable kind name of the failure.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The original error, when the failure happened in this process.
    pub fn original(&self) -> Option<&anyhow::Error> {
        self.original.as_deref()
    }
}

/// Handle to a single submitted task.
///
/// Cloning a handle is cheap; clones observe the same completion.
#[derive(Clone)]
pub struct Task {
    slot: Arc<CompletionSlot>,
    task_id: Option<String>,
    master: Option<Arc<TaskMaster>>,
    start_time: Instant,
}

impl Task {
    /// Handle for a smart-path submission, wired to the task master.
    pub(crate) fn managed(
        slot: Arc<CompletionSlot>,
        task_id: String,
        master: Arc<TaskMaster>,
    ) -> Self {
        Self {
            slot,
            task_id: Some(task_id),
            master: Some(master),
            start_time: Instant::now(),
        }
    }

    /// Handle for a direct-path submission: no id, no cache, no promotion.
    pub(crate) fn direct(slot: Arc<CompletionSlot>) -> Self {
        Self {
            slot,
            task_id: None,
            master: None,
            start_time: Instant::now(),
        }
    }

    /// A handle that reads as already complete with no value.
    ///
    /// Returned for submissions that arrive during shutdown, so callers
    /// observe completion instead of hanging.
    pub fn drained() -> Self {
        let slot = Arc::new(CompletionSlot::new());
        slot.cancel();
        Self::direct(slot)
    }

    /// The task id; present only for smart-path handles.
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// Wait for the realised outcome without raising task failures.
    ///
    /// Consults the result cache first (consuming the entry), promotes the
    /// pending submission, then blocks on the completion slot up to
    /// `timeout`. Timeouts and cancellation surface as errors; a task
    /// failure is returned as the `Err` side of the outcome.
    pub fn outcome(&self, timeout: Option<Duration>) -> TaskmanResult<TaskOutcome> {
        if let (Some(task_id), Some(master)) = (&self.task_id, &self.master) {
            if let Some(outcome) = master.take_cached(task_id) {
                return Ok(outcome);
            }
            // The caller is blocked on this task now; move it up the queue.
            master.promote_task(task_id);
        }
        self.slot.wait(timeout)
    }

    /// Wait for the result, raising task failures.
    pub fn await_result(&self) -> TaskmanResult<TaskValue> {
        self.resolve(None)
    }

    /// Wait for the result up to `timeout`, raising task failures.
    ///
    /// An elapsed budget does not cancel the underlying task; a later wait
    /// can still collect the result.
    pub fn await_result_timeout(&self, timeout: Duration) -> TaskmanResult<TaskValue> {
        self.resolve(Some(timeout))
    }

    /// Alias for [`Task::await_result`].
    pub fn result(&self) -> TaskmanResult<TaskValue> {
        self.await_result()
    }

    fn resolve(&self, timeout: Option<Duration>) -> TaskmanResult<TaskValue> {
        match self.outcome(timeout)? {
            Ok(value) => Ok(value),
            Err(exception) => {
                error!(
                    "task {} failed: {exception}",
                    self.task_id.as_deref().unwrap_or("<direct>")
                );
                Err(TaskmanError::Task(exception))
            }
        }
    }

    /// The task failure, if the task has failed. Blocks until completion.
    pub fn exception(&self) -> Option<TaskException> {
        match self.outcome(None) {
            Ok(Err(exception)) => Some(exception),
            _ => None,
        }
    }

    /// Whether the task has completed, successfully or not.
    pub fn is_done(&self) -> bool {
        if let (Some(task_id), Some(master)) = (&self.task_id, &self.master) {
            if master.has_cached(task_id) {
                return true;
            }
        }
        self.slot.is_done()
    }

    /// Whether the task has completed with a value.
    ///
    /// Cancelled handles read as done but not successful, with no
    /// exception.
    pub fn is_successful(&self) -> bool {
        if let (Some(task_id), Some(master)) = (&self.task_id, &self.master) {
            if let Some(outcome) = master.peek_cached(task_id) {
                return outcome.is_ok();
            }
        }
        matches!(self.slot.snapshot(), SlotState::Ready(Ok(_)))
    }

    /// Wall-clock time from submission to completion.
    ///
    /// Stable once the task has completed; grows while it is running.
    pub fn duration(&self) -> Duration {
        self.slot
            .resolved_at()
            .map(|at| at.saturating_duration_since(self.start_time))
            .unwrap_or_else(|| self.start_time.elapsed())
    }

    pub(crate) fn slot(&self) -> &Arc<CompletionSlot> {
        &self.slot
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("task_id", &self.task_id)
            .field("done", &self.slot.is_done())
            .finish()
    }
}

/// Ordered collection of task handles awaited together.
#[derive(Debug)]
pub struct Tasks {
    tasks: Vec<Task>,
    start_time: Instant,
}

impl Tasks {
    /// An empty batch.
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Add a handle to the batch.
    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Number of tasks in the batch.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Borrow a handle by submission index.
    pub fn get(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    /// Iterate the handles in submission order.
    pub fn iter(&self) -> std::slice::Iter<'_, Task> {
        self.tasks.iter()
    }

    /// Block until every task completes; results in submission order.
    ///
    /// Failed and cancelled tasks are represented as [`TaskException`]
    /// outcomes rather than raised.
    pub fn outcomes(&self) -> Vec<TaskOutcome> {
        self.tasks
            .iter()
            .map(|task| match task.outcome(None) {
                Ok(outcome) => outcome,
                Err(error) => Err(TaskException::from_error(error.into())),
            })
            .collect()
    }

    /// Block until every task completes (or one fails); results in
    /// submission order.
    ///
    /// The first failure — observed in completion order, so a fast failure
    /// is raised without waiting for slower tasks — aborts the wait.
    pub fn await_results(&self) -> TaskmanResult<Vec<TaskValue>> {
        for (_, outcome) in self.iter_completed() {
            if let Err(exception) = outcome {
                return Err(TaskmanError::Task(exception));
            }
        }
        self.tasks.iter().map(Task::await_result).collect()
    }

    /// Block until every task completes; successful results only, in
    /// submission order.
    pub fn successful_results(&self) -> Vec<TaskValue> {
        self.outcomes().into_iter().filter_map(Result::ok).collect()
    }

    /// Block until every task completes; the failure of each task, in
    /// submission order (`None` for tasks that succeeded).
    pub fn exceptions(&self) -> Vec<Option<TaskException>> {
        self.tasks.iter().map(Task::exception).collect()
    }

    /// Yield `(submission index, outcome)` pairs as tasks complete.
    ///
    /// Completion order, not submission order.
    pub fn iter_completed(&self) -> CompletedIter<'_> {
        CompletedIter {
            tasks: &self.tasks,
            pending: (0..self.tasks.len()).collect(),
        }
    }

    /// Whether every task has completed.
    pub fn are_done(&self) -> bool {
        self.tasks.iter().all(Task::is_done)
    }

    /// Whether every task has completed successfully.
    pub fn are_successful(&self) -> bool {
        self.tasks.iter().all(Task::is_successful)
    }

    /// Whether at least one task has completed.
    pub fn is_any_done(&self) -> bool {
        self.tasks.iter().any(Task::is_done)
    }

    /// Number of completed tasks.
    pub fn completed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_done()).count()
    }

    /// Number of successfully completed tasks.
    pub fn successful_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_successful()).count()
    }

    /// Number of tasks that completed without a value.
    pub fn failure_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.is_done() && !t.is_successful())
            .count()
    }

    /// Total number of tasks.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Batch wall-clock time: up to the latest completion once all tasks
    /// are done, still growing otherwise.
    pub fn duration(&self) -> Duration {
        if !self.are_done() {
            return self.start_time.elapsed();
        }
        self.tasks
            .iter()
            .filter_map(|t| t.slot.resolved_at())
            .map(|at| at.saturating_duration_since(self.start_time))
            .max()
            .unwrap_or_else(|| self.start_time.elapsed())
    }
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<Task>> for Tasks {
    fn from(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            start_time: Instant::now(),
        }
    }
}

impl std::ops::Index<usize> for Tasks {
    type Output = Task;

    fn index(&self, index: usize) -> &Task {
        &self.tasks[index]
    }
}

impl<'a> IntoIterator for &'a Tasks {
    type Item = &'a Task;
    type IntoIter = std::slice::Iter<'a, Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}

impl IntoIterator for Tasks {
    type Item = Task;
    type IntoIter = std::vec::IntoIter<Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.into_iter()
    }
}

/// Completion-order iterator over a batch. See [`Tasks::iter_completed`].
pub struct CompletedIter<'a> {
    tasks: &'a [Task],
    pending: Vec<usize>,
}

impl Iterator for CompletedIter<'_> {
    type Item = (usize, TaskOutcome);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pending.is_empty() {
            return None;
        }
        loop {
            let found = self.pending.iter().position(|&index| {
                !matches!(self.tasks[index].slot.snapshot(), SlotState::Pending)
            });
            if let Some(position) = found {
                let index = self.pending.remove(position);
                let outcome = match self.tasks[index].slot.snapshot() {
                    SlotState::Ready(outcome) => outcome,
                    _ => Err(TaskException::new("Cancelled", "task was cancelled")),
                };
                return Some((index, outcome));
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn completed_task(outcome: TaskOutcome) -> Task {
        let slot = Arc::new(CompletionSlot::new());
        slot.complete(outcome);
        Task::direct(slot)
    }

    fn pending_task() -> (Task, Arc<CompletionSlot>) {
        let slot = Arc::new(CompletionSlot::new());
        (Task::direct(Arc::clone(&slot)), slot)
    }

    #[test]
    fn test_exception_carries_kind_and_message() {
        let exception = TaskException::from_error(anyhow::anyhow!("boom"));
        assert_eq!(exception.kind(), "TaskError");
        assert_eq!(exception.message(), "boom");
        assert!(exception.original().is_some());

        let exception = TaskException::from_error(TaskmanError::Cancelled.into());
        assert_eq!(exception.kind(), "Cancelled");
    }

    #[test]
    fn test_exception_serialises_without_original() {
        let exception = TaskException::from_error(anyhow::anyhow!("boom"));
        let json = serde_json::to_string(&exception).unwrap();
        let parsed: TaskException = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind(), "TaskError");
        assert_eq!(parsed.message(), "boom");
        assert!(parsed.original().is_none());
    }

    #[test]
    fn test_task_status_accessors() {
        let task = completed_task(Ok(TaskValue::from(3)));
        assert!(task.is_done());
        assert!(task.is_successful());
        assert!(task.exception().is_none());
        assert_eq!(task.await_result().unwrap().as_i64(), Some(3));
        // Repeat reads keep returning the realised value.
        assert_eq!(task.await_result().unwrap().as_i64(), Some(3));

        let task = completed_task(Err(TaskException::new("RuntimeError", "bad")));
        assert!(task.is_done());
        assert!(!task.is_successful());
        assert_eq!(task.exception().unwrap().kind(), "RuntimeError");
        assert!(matches!(task.await_result(), Err(TaskmanError::Task(_))));
    }

    #[test]
    fn test_drained_task_reads_as_complete_without_value() {
        let task = Task::drained();
        assert!(task.is_done());
        assert!(!task.is_successful());
        assert!(task.exception().is_none());
        assert!(matches!(task.await_result(), Err(TaskmanError::Cancelled)));
    }

    #[test]
    fn test_await_result_timeout_then_success() {
        let (task, slot) = pending_task();
        let err = task
            .await_result_timeout(Duration::from_millis(20))
            .unwrap_err();
        assert!(err.is_timeout());

        slot.complete(Ok(TaskValue::from("late")));
        assert_eq!(task.await_result().unwrap().as_str(), Some("late"));
    }

    #[test]
    fn test_duration_stabilises_after_completion() {
        let (task, slot) = pending_task();
        thread::sleep(Duration::from_millis(10));
        slot.complete(Ok(TaskValue::Null));
        let first = task.duration();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(task.duration(), first);
    }

    #[test]
    fn test_batch_ordered_outcomes_and_counts() {
        let batch = Tasks::from(vec![
            completed_task(Ok(TaskValue::from(1))),
            completed_task(Err(TaskException::new("RuntimeError", "boom"))),
            completed_task(Ok(TaskValue::from(2))),
        ]);

        assert!(batch.are_done());
        assert!(!batch.are_successful());
        assert!(batch.is_any_done());
        assert_eq!(batch.total_count(), 3);
        assert_eq!(batch.completed_count(), 3);
        assert_eq!(batch.successful_count(), 2);
        assert_eq!(batch.failure_count(), 1);

        let outcomes = batch.outcomes();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].as_ref().unwrap().as_i64(), Some(1));
        assert_eq!(outcomes[1].as_ref().unwrap_err().kind(), "RuntimeError");
        assert_eq!(outcomes[2].as_ref().unwrap().as_i64(), Some(2));

        let successful = batch.successful_results();
        assert_eq!(successful.len(), 2);
        assert_eq!(successful[0].as_i64(), Some(1));
        assert_eq!(successful[1].as_i64(), Some(2));

        assert!(matches!(
            batch.await_results(),
            Err(TaskmanError::Task(_))
        ));
    }

    #[test]
    fn test_batch_await_results_in_submission_order() {
        let (slow, slow_slot) = pending_task();
        let batch = Tasks::from(vec![slow, completed_task(Ok(TaskValue::from(2)))]);

        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            slow_slot.complete(Ok(TaskValue::from(1)));
        });

        let results = batch.await_results().unwrap();
        assert_eq!(results[0].as_i64(), Some(1));
        assert_eq!(results[1].as_i64(), Some(2));
        resolver.join().unwrap();
    }

    #[test]
    fn test_lazy_iteration_yields_completion_order() {
        let (slow, slow_slot) = pending_task();
        let batch = Tasks::from(vec![slow, completed_task(Ok(TaskValue::from(2)))]);

        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            slow_slot.complete(Ok(TaskValue::from(1)));
        });

        let completed: Vec<(usize, TaskOutcome)> = batch.iter_completed().collect();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].0, 1, "the already-finished task comes first");
        assert_eq!(completed[1].0, 0);
        resolver.join().unwrap();
    }

    #[test]
    fn test_empty_batch() {
        let batch = Tasks::new();
        assert!(batch.is_empty());
        assert!(batch.are_done());
        assert!(!batch.is_any_done());
        assert!(batch.await_results().unwrap().is_empty());
        assert_eq!(batch.iter_completed().count(), 0);
    }
}
