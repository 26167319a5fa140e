//! Mode-switchable execution façade.
//!
//! [`TaskExecutor`] is the entry point collaborators use. In smart mode it
//! delegates every submission to the [`TaskMaster`], getting the priority
//! queue, result cache and promotion for free. In direct mode it owns a
//! private thread pool and CPU pool and bypasses all of that — handles
//! have no task id and waits are plain slot waits — for latency-critical
//! or test usage.
//!
//! `race` is special: it always runs on a private direct thread pool,
//! whatever the mode, so racing never contends with queued work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use log::{debug, info, warn};

use crate::config::EngineConfig;
use crate::core::completion::CompletionSlot;
use crate::core::job::{Job, TaskKind};
use crate::core::master::{TaskMaster, TaskMasterStats};
use crate::core::pool::WorkerPool;
use crate::core::task::{Task, Tasks};
use crate::core::value::TaskValue;
use crate::error::{TaskmanError, TaskmanResult};

/// Operating mode of a [`TaskExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Delegate to the task master: queue, cache, promotion.
    Smart,
    /// Private pools, no queue traversal, no cache lookups.
    Direct,
}

/// Which pool a `parallel` call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelScope {
    /// The thread pool.
    Multithreading,
    /// The CPU worker pool.
    Multiprocessing,
}

/// Mode-switchable task execution façade.
pub struct TaskExecutor {
    mode: ExecutionMode,
    master: Option<Arc<TaskMaster>>,
    thread_pool: Mutex<Option<Arc<WorkerPool>>>,
    cpu_pool: Option<Arc<WorkerPool>>,
    thread_pool_size: usize,
    shutting_down: AtomicBool,
}

impl TaskExecutor {
    /// Create an executor in the given mode, sized from the environment
    /// configuration.
    pub fn new(mode: ExecutionMode) -> Self {
        let config = EngineConfig::load().unwrap_or_else(|error| {
            warn!("falling back to default configuration: {error}");
            EngineConfig::default()
        });
        match mode {
            ExecutionMode::Smart => Self::smart(Arc::clone(TaskMaster::global()), &config),
            ExecutionMode::Direct => {
                Self::direct_with_sizes(config.thread_pool_size, config.cpu_pool_size)
            }
        }
    }

    /// Smart-mode executor bound to a specific task master instead of the
    /// process-wide one. This is what tests and embedders with their own
    /// service lifecycle use.
    pub fn with_master(master: Arc<TaskMaster>) -> Self {
        let config = master.config().clone();
        Self::smart(master, &config)
    }

    /// Direct-mode executor with explicit pool sizes.
    pub fn direct_with_sizes(thread_pool_size: usize, cpu_pool_size: usize) -> Self {
        info!("task executor initialised in direct mode");
        Self {
            mode: ExecutionMode::Direct,
            master: None,
            thread_pool: Mutex::new(Some(Arc::new(WorkerPool::new(
                "direct-thread",
                thread_pool_size,
            )))),
            cpu_pool: (cpu_pool_size > 0)
                .then(|| Arc::new(WorkerPool::new("direct-cpu", cpu_pool_size))),
            thread_pool_size,
            shutting_down: AtomicBool::new(false),
        }
    }

    fn smart(master: Arc<TaskMaster>, config: &EngineConfig) -> Self {
        info!("task executor initialised in smart mode");
        Self {
            mode: ExecutionMode::Smart,
            master: Some(master),
            thread_pool: Mutex::new(None),
            cpu_pool: None,
            thread_pool_size: config.thread_pool_size,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// The mode this executor operates in.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Run a single job in the background.
    ///
    /// During shutdown this returns a drained handle: the caller observes
    /// completion with no value instead of hanging.
    pub fn background(&self, job: Job) -> Task {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!("task executor is shutting down, returning drained task");
            return Task::drained();
        }
        match &self.master {
            Some(master) => self.submit_or_drain(master, TaskKind::Mixed, 0, job),
            None => Self::spawn_direct(&self.race_pool(), job),
        }
    }

    /// Run a single job through the smart path with an explicit kind and
    /// priority. Falls back to [`TaskExecutor::background`] semantics in
    /// direct mode.
    pub fn background_with(&self, kind: TaskKind, priority: i32, job: Job) -> Task {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!("task executor is shutting down, returning drained task");
            return Task::drained();
        }
        match &self.master {
            Some(master) => self.submit_or_drain(master, kind, priority, job),
            None => Self::spawn_direct(&self.race_pool(), job),
        }
    }

    /// Run a batch of I/O-bound jobs in parallel on threads.
    pub fn multithread(&self, jobs: Vec<Job>, show_progress: bool) -> Tasks {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!("task executor is shutting down, returning empty batch");
            return Tasks::new();
        }

        let progress = progress_bar(show_progress, jobs.len());
        let mut batch = Tasks::new();
        for job in jobs {
            let task = match &self.master {
                Some(master) => self.submit_or_drain(master, TaskKind::Io, 0, job),
                None => Self::spawn_direct(&self.race_pool(), job),
            };
            batch.push(task);
            if let Some(bar) = &progress {
                bar.inc(1);
            }
        }
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }
        batch
    }

    /// Run a batch of CPU-bound jobs in parallel on the CPU worker pool.
    ///
    /// Rejects async jobs synchronously, before anything is enqueued: an
    /// event loop has no place on the CPU pool.
    pub fn multiprocess(&self, jobs: Vec<Job>, show_progress: bool) -> TaskmanResult<Tasks> {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!("task executor is shutting down, returning empty batch");
            return Ok(Tasks::new());
        }

        if let Some(position) = jobs.iter().position(Job::is_async) {
            return Err(TaskmanError::validation(format!(
                "job #{position} is async and cannot run on the CPU worker pool"
            )));
        }

        let progress = progress_bar(show_progress, jobs.len());
        let mut batch = Tasks::new();
        match &self.master {
            Some(master) => {
                for job in jobs {
                    batch.push(self.submit_or_drain(master, TaskKind::Cpu, 0, job));
                    if let Some(bar) = &progress {
                        bar.inc(1);
                    }
                }
            }
            None => {
                let pool = self.cpu_pool.clone().ok_or_else(|| {
                    TaskmanError::validation("the CPU worker pool is disabled (cpu_pool_size = 0)")
                })?;
                for job in jobs {
                    batch.push(Self::spawn_direct(&pool, job));
                    if let Some(bar) = &progress {
                        bar.inc(1);
                    }
                }
            }
        }
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }
        Ok(batch)
    }

    /// Run a batch in the chosen scope.
    pub fn parallel(
        &self,
        jobs: Vec<Job>,
        scope: ParallelScope,
        show_progress: bool,
    ) -> TaskmanResult<Tasks> {
        match scope {
            ParallelScope::Multithreading => Ok(self.multithread(jobs, show_progress)),
            ParallelScope::Multiprocessing => self.multiprocess(jobs, show_progress),
        }
    }

    /// Race jobs against each other and return the first success.
    ///
    /// Runs on a private direct thread pool regardless of mode. When every
    /// contender fails, the preferred task wins if one was named and has
    /// finished; otherwise the last task to finish is returned. Losers are
    /// cancelled, as is everything still running when `timeout` elapses.
    pub fn race(
        &self,
        jobs: Vec<Job>,
        preferred_task_idx: Option<usize>,
        timeout: Option<Duration>,
    ) -> TaskmanResult<Task> {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!("task executor is shutting down, returning drained task");
            return Ok(Task::drained());
        }
        if jobs.is_empty() {
            return Err(TaskmanError::validation("race requires at least one task"));
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(TaskmanError::validation(
                "race timeout must be greater than 0",
            ));
        }
        if let Some(index) = preferred_task_idx {
            if index >= jobs.len() {
                return Err(TaskmanError::validation(format!(
                    "preferred task index {index} out of range [0, {})",
                    jobs.len()
                )));
            }
        }

        let pool = self.race_pool();
        let started = Instant::now();
        debug!("racing {} tasks on the direct thread pool", jobs.len());
        let tasks: Vec<Task> = jobs
            .into_iter()
            .map(|job| Self::spawn_direct(&pool, job))
            .collect();

        let mut pending: Vec<usize> = (0..tasks.len()).collect();
        let result = loop {
            if let Some(budget) = timeout {
                if started.elapsed() >= budget {
                    break Err(TaskmanError::timeout(budget));
                }
            }

            let done: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|&index| tasks[index].is_done())
                .collect();
            if done.is_empty() {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }

            if let Some(&winner) = done.iter().find(|&&index| tasks[index].is_successful()) {
                debug!("race won by task #{winner}");
                break Ok(tasks[winner].clone());
            }

            // Everything finished so far has failed.
            if let Some(preferred) = preferred_task_idx {
                if done.contains(&preferred) {
                    debug!("race fell back to preferred task #{preferred}");
                    break Ok(tasks[preferred].clone());
                }
                pending.retain(|index| !done.contains(index));
            } else if done.len() == pending.len() {
                // No contender left to wait for; the last finisher is the
                // result even though it failed.
                let last = pending
                    .iter()
                    .copied()
                    .max_by_key(|&index| tasks[index].slot().resolved_at())
                    .expect("pending checked non-empty");
                break Ok(tasks[last].clone());
            } else {
                // done is a strict subset of pending here (the equal-size
                // case returned above), so at least one contender survives
                // the prune and pending never empties.
                pending.retain(|index| !done.contains(index));
            }
        };

        // Cancel whatever is still running and lost.
        let winner_slot = result.as_ref().ok().map(|task| Arc::clone(task.slot()));
        for task in &tasks {
            let is_winner = winner_slot
                .as_ref()
                .is_some_and(|slot| Arc::ptr_eq(slot, task.slot()));
            if !is_winner && !task.slot().is_done() {
                task.slot().cancel();
            }
        }
        result
    }

    /// Shut the executor down.
    ///
    /// With `wait`, blocks until the private pools drain or `timeout`
    /// elapses. In smart mode, also shuts the task master down.
    pub fn cleanup(&self, wait: bool, timeout: Option<Duration>) {
        info!("cleaning up task executor");
        self.shutting_down.store(true, Ordering::SeqCst);

        if wait {
            let deadline = timeout.map(|t| Instant::now() + t);
            loop {
                let busy = self.direct_busy_count();
                if busy == 0 {
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    warn!("{busy} direct tasks did not complete in time");
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }

        if let Some(pool) = self.thread_pool.lock().unwrap().take() {
            pool.shutdown(false);
        }
        if let Some(pool) = &self.cpu_pool {
            pool.shutdown(false);
        }
        if let Some(master) = &self.master {
            master.shutdown(wait, timeout);
        }
        info!("task executor cleanup complete");
    }

    /// Drive an awaitable to completion on a local event loop.
    pub fn await_async<F: std::future::Future>(future: F) -> TaskmanResult<F::Output> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| {
                TaskmanError::internal(format!("failed to build event loop: {error}"))
            })?;
        Ok(runtime.block_on(future))
    }

    /// Block on a single handle, raising its failure.
    pub fn wait(task: &Task, timeout: Option<Duration>) -> TaskmanResult<TaskValue> {
        match task.outcome(timeout)? {
            Ok(value) => Ok(value),
            Err(exception) => Err(TaskmanError::Task(exception)),
        }
    }

    /// Engine statistics; available in smart mode only.
    pub fn stats(&self) -> Option<TaskMasterStats> {
        self.master.as_ref().map(|master| master.get_stats())
    }

    fn submit_or_drain(
        &self,
        master: &Arc<TaskMaster>,
        kind: TaskKind,
        priority: i32,
        job: Job,
    ) -> Task {
        master.submit(kind, priority, job).unwrap_or_else(|error| {
            warn!("task master refused submission ({error}); returning drained task");
            Task::drained()
        })
    }

    /// The direct thread pool, created lazily in smart mode (for `race`).
    fn race_pool(&self) -> Arc<WorkerPool> {
        let mut guard = self.thread_pool.lock().unwrap();
        Arc::clone(guard.get_or_insert_with(|| {
            Arc::new(WorkerPool::new("direct-thread", self.thread_pool_size))
        }))
    }

    fn spawn_direct(pool: &Arc<WorkerPool>, job: Job) -> Task {
        let slot = Arc::new(CompletionSlot::new());
        let resolver = Arc::clone(&slot);
        let submitted = pool.execute(Box::new(move || {
            let outcome = job.run();
            resolver.complete(outcome);
        }));
        if submitted.is_err() {
            // The pool is gone; the handle reads as complete with no value.
            slot.cancel();
        }
        Task::direct(slot)
    }

    fn direct_busy_count(&self) -> usize {
        let threads = self
            .thread_pool
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |pool| pool.busy_count());
        let cpu = self.cpu_pool.as_ref().map_or(0, |pool| pool.busy_count());
        threads + cpu
    }
}

fn progress_bar(enabled: bool, total: usize) -> Option<ProgressBar> {
    enabled.then(|| ProgressBar::new(total as u64))
}
