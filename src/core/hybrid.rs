//! Hybrid executor: a thread pool plus an optional CPU worker pool.
//!
//! The thread pool takes I/O, mixed and async work; the CPU pool, when
//! enabled, is reserved for declared CPU-bound sync jobs so heavy
//! computation cannot starve the latency-sensitive threads. Completions
//! are reported over a channel to whoever is bridging them to caller
//! handles.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::core::completion::TaskOutcome;
use crate::core::job::TaskKind;
use crate::core::pool::WorkerPool;
use crate::core::queue::TaskSubmission;
use crate::error::TaskmanResult;

/// A finished (or cancelled) execution reported by an executor.
#[derive(Debug)]
pub(crate) struct TaskCompletion {
    pub task_id: String,
    pub outcome: ExecutorOutcome,
}

/// How the execution ended at the executor boundary.
#[derive(Debug)]
pub(crate) enum ExecutorOutcome {
    Finished(TaskOutcome),
    Cancelled,
}

/// Channel end completions are reported on.
pub(crate) type CompletionSender = Sender<TaskCompletion>;

struct ExecutorState {
    active: HashSet<String>,
    last_activity: Instant,
}

/// A thread pool and an optional CPU worker pool acting as one executor.
pub struct HybridExecutor {
    max_threads: usize,
    max_cpu_workers: usize,
    thread_pool: WorkerPool,
    cpu_pool: Option<WorkerPool>,
    state: Arc<Mutex<ExecutorState>>,
    cancelled: Arc<AtomicBool>,
}

impl HybridExecutor {
    /// Create an executor with `max_threads` pool threads and, when
    /// `max_cpu_workers > 0`, a dedicated CPU worker pool.
    pub fn new(max_threads: usize, max_cpu_workers: usize) -> Self {
        assert!(max_threads > 0, "max_threads must be greater than 0");

        Self {
            max_threads,
            max_cpu_workers,
            thread_pool: WorkerPool::new("hybrid-thread", max_threads),
            cpu_pool: (max_cpu_workers > 0).then(|| WorkerPool::new("hybrid-cpu", max_cpu_workers)),
            state: Arc::new(Mutex::new(ExecutorState {
                active: HashSet::new(),
                last_activity: Instant::now(),
            })),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Route a submission to the right pool and start it.
    ///
    /// Async jobs always run on the thread pool (driven by a per-task event
    /// loop); declared CPU-bound sync jobs go to the CPU pool when one
    /// exists; everything else goes to the thread pool. The wrapped job
    /// reports on `done_tx` once it finishes, gets cancelled at the pool
    /// boundary, or panics.
    pub(crate) fn submit(
        &self,
        submission: TaskSubmission,
        done_tx: CompletionSender,
    ) -> TaskmanResult<()> {
        let task_id = submission.task_id.clone();
        {
            let mut state = self.state.lock().unwrap();
            state.active.insert(task_id.clone());
            state.last_activity = Instant::now();
        }

        let wants_cpu_pool = !submission.job.is_async() && submission.kind == TaskKind::Cpu;
        let pool = match &self.cpu_pool {
            Some(cpu_pool) if wants_cpu_pool => cpu_pool,
            _ => &self.thread_pool,
        };

        let job = submission.job;
        let cancelled = Arc::clone(&self.cancelled);
        let state = Arc::clone(&self.state);
        let result = pool.execute(Box::new(move || {
            let outcome = if cancelled.load(Ordering::SeqCst) {
                ExecutorOutcome::Cancelled
            } else {
                ExecutorOutcome::Finished(job.run())
            };
            {
                let mut state = state.lock().unwrap();
                state.active.remove(&task_id);
                state.last_activity = Instant::now();
            }
            if done_tx.send(TaskCompletion { task_id, outcome }).is_err() {
                warn!("completion receiver dropped before a task could report");
            }
        }));

        if result.is_err() {
            // The pool refused the work; roll the bookkeeping back.
            let mut state = self.state.lock().unwrap();
            state.active.remove(&submission.task_id);
            state.last_activity = Instant::now();
        }
        result
    }

    /// Utilisation in [0, 1]: the busier of thread occupancy and the
    /// estimated CPU-pool occupancy.
    pub fn get_load(&self) -> f64 {
        let thread_load = self.thread_pool.busy_count() as f64 / self.max_threads as f64;
        let cpu_load = if self.cpu_pool.is_some() {
            let active = self.state.lock().unwrap().active.len();
            active as f64 / self.max_cpu_workers.max(1) as f64
        } else {
            0.0
        };
        thread_load.max(cpu_load).clamp(0.0, 1.0)
    }

    /// Number of tasks currently inside this executor.
    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// Whether the executor has had no work for at least `threshold`.
    pub fn is_idle(&self, threshold: Duration) -> bool {
        let state = self.state.lock().unwrap();
        state.active.is_empty() && state.last_activity.elapsed() > threshold
    }

    /// Shut both pools down.
    ///
    /// With `wait = false`, queued-but-unstarted work is cancelled at the
    /// pool boundary and reported as such.
    pub fn shutdown(&self, wait: bool) {
        debug!("shutting down hybrid executor");
        if !wait {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        self.thread_pool.shutdown(wait);
        if let Some(cpu_pool) = &self.cpu_pool {
            cpu_pool.shutdown(wait);
        }
    }

    /// Configured thread pool size.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Configured CPU pool size (0 when disabled).
    pub fn max_cpu_workers(&self) -> usize {
        self.max_cpu_workers
    }
}
