//! Task master: the process-wide task management service.
//!
//! Accepts submissions, assigns ids, queues them by priority, dispatches
//! them to the least-loaded hybrid executor and bridges executor
//! completions back to caller handles and into the result cache.
//!
//! Two background workers drive the engine:
//! - the **dispatcher** drains the priority queue and hands submissions to
//!   executors, skipping queue tickets whose submission has already been
//!   dispatched (which is what makes promotion re-enqueues harmless);
//! - the **bridge** relays executor completions: it writes the outcome to
//!   the result cache, resolves the handle's completion slot and retires
//!   the handle from the active registry. The bridge is the only component
//!   that resolves managed handles, and it resolves them in every case so
//!   no caller can block forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::core::completion::{CompletionSlot, TaskOutcome};
use crate::core::hybrid::{CompletionSender, ExecutorOutcome, TaskCompletion};
use crate::core::job::{Job, TaskKind};
use crate::core::manager::DynamicPoolManager;
use crate::core::monitor::ResourceMonitor;
use crate::core::queue::{SubmissionQueue, TaskSubmission};
use crate::core::task::{Task, TaskException};
use crate::error::{TaskmanError, TaskmanResult};

/// Dispatcher queue poll; bounds how long shutdown waits for the worker.
const DISPATCH_POLL: Duration = Duration::from_millis(200);

struct MasterState {
    pending: HashMap<String, TaskSubmission>,
    active: HashMap<String, Arc<CompletionSlot>>,
    queue_wait_total: Duration,
    dispatched: u64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct TaskMasterStats {
    /// Submissions not yet handed to an executor.
    pub pending_tasks: usize,
    /// Handles whose completion slot is not resolved yet.
    pub active_tasks: usize,
    /// Current hybrid executor count.
    pub executors: usize,
    /// Entries in the memory cache tier.
    pub memory_cache_size: usize,
    /// Mean time dispatched submissions spent queued, in seconds.
    pub avg_queue_wait_seconds: f64,
    /// CPU utilisation in [0, 1].
    pub cpu_load: f64,
    /// Memory utilisation in [0, 1].
    pub memory_load: f64,
    /// Combined system load in [0, 1].
    pub system_load: f64,
}

/// The task management service. One per process in normal use (see
/// [`TaskMaster::global`]); tests construct isolated instances.
pub struct TaskMaster {
    config: EngineConfig,
    queue: SubmissionQueue,
    state: Mutex<MasterState>,
    cache: ResultCache,
    pool_manager: Arc<DynamicPoolManager>,
    monitor: ResourceMonitor,
    running: AtomicBool,
    draining: AtomicBool,
    completion_tx: Mutex<Option<CompletionSender>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    bridge: Mutex<Option<JoinHandle<()>>>,
}

impl TaskMaster {
    /// Build a task master and start its background workers.
    pub fn new(config: EngineConfig) -> TaskmanResult<Arc<Self>> {
        config.validate()?;

        let cache = ResultCache::new(&config)?;
        let monitor = ResourceMonitor::new(config.sample_interval());
        let pool_manager = DynamicPoolManager::new(
            config.thread_pool_size,
            config.cpu_pool_size,
            config.spawn_threshold(),
            config.idle_reclaim(),
            config.cleanup_interval(),
        );
        let (completion_tx, completion_rx) = channel();

        let master = Arc::new(Self {
            config,
            queue: SubmissionQueue::new(),
            state: Mutex::new(MasterState {
                pending: HashMap::new(),
                active: HashMap::new(),
                queue_wait_total: Duration::ZERO,
                dispatched: 0,
            }),
            cache,
            pool_manager,
            monitor,
            running: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            completion_tx: Mutex::new(Some(completion_tx)),
            dispatcher: Mutex::new(None),
            bridge: Mutex::new(None),
        });

        master.monitor.start();

        let dispatcher_target = Arc::clone(&master);
        let dispatcher = std::thread::Builder::new()
            .name("taskman-dispatcher".to_string())
            .spawn(move || dispatcher_target.dispatch_loop())
            .expect("failed to spawn dispatcher thread");
        *master.dispatcher.lock().unwrap() = Some(dispatcher);

        let bridge_target = Arc::clone(&master);
        let bridge = std::thread::Builder::new()
            .name("taskman-bridge".to_string())
            .spawn(move || bridge_target.bridge_loop(completion_rx))
            .expect("failed to spawn bridge thread");
        *master.bridge.lock().unwrap() = Some(bridge);

        info!("task master initialised");
        Ok(master)
    }

    /// The process-wide task master, initialised on first use from the
    /// environment configuration.
    ///
    /// Embedders that want deterministic teardown call
    /// [`TaskMaster::shutdown`] from their exit path.
    pub fn global() -> &'static Arc<TaskMaster> {
        static INSTANCE: OnceCell<Arc<TaskMaster>> = OnceCell::new();
        INSTANCE.get_or_init(|| {
            let config = EngineConfig::load().unwrap_or_else(|error| {
                warn!("falling back to default configuration: {error}");
                EngineConfig::default()
            });
            TaskMaster::new(config).expect("failed to initialise the global task master")
        })
    }

    /// Submit a job for execution.
    ///
    /// Fails fast once shutdown has begun.
    pub fn submit(self: &Arc<Self>, kind: TaskKind, priority: i32, job: Job) -> TaskmanResult<Task> {
        if !self.running.load(Ordering::SeqCst) {
            error!("task master is shutting down, cannot submit tasks");
            return Err(TaskmanError::ShuttingDown);
        }

        let task_id = Uuid::new_v4().to_string();
        let submission = TaskSubmission {
            task_id: task_id.clone(),
            job,
            kind,
            priority,
            seq: self.queue.next_seq(),
            submitted_at: Instant::now(),
            promoted: false,
        };
        let ticket = submission.ticket();
        let slot = Arc::new(CompletionSlot::new());

        {
            let mut state = self.state.lock().unwrap();
            state.pending.insert(task_id.clone(), submission);
            state.active.insert(task_id.clone(), Arc::clone(&slot));
        }
        self.queue.push(ticket);

        debug!(
            "submitted task {} (kind={kind:?}, priority={priority})",
            short(&task_id)
        );
        Ok(Task::managed(slot, task_id, Arc::clone(self)))
    }

    /// Mark a pending submission as promoted and re-enqueue it.
    ///
    /// Idempotent: already-promoted and already-dispatched submissions are
    /// left alone. The stale ticket a promotion leaves behind is discarded
    /// by the dispatcher when its id is no longer pending.
    pub fn promote_task(&self, task_id: &str) {
        let ticket = {
            let mut state = self.state.lock().unwrap();
            match state.pending.get_mut(task_id) {
                Some(submission) if !submission.promoted => {
                    submission.promoted = true;
                    Some(submission.ticket())
                }
                _ => None,
            }
        };
        if let Some(ticket) = ticket {
            self.queue.push(ticket);
            debug!("promoted task {} to the front of the queue", short(task_id));
        }
    }

    fn dispatch_loop(&self) {
        // Keeps going through the drain phase of a waiting shutdown, so
        // already-accepted submissions still reach an executor.
        while self.running.load(Ordering::SeqCst) || self.draining.load(Ordering::SeqCst) {
            let Some(ticket) = self.queue.pop_timeout(DISPATCH_POLL) else {
                continue;
            };

            // A missing id means the ticket is stale: the submission was
            // already dispatched via a promoted duplicate, or shutdown
            // cleared it.
            let submission = {
                let mut state = self.state.lock().unwrap();
                let submission = state.pending.remove(&ticket.task_id);
                if let Some(submission) = &submission {
                    state.queue_wait_total += submission.submitted_at.elapsed();
                    state.dispatched += 1;
                }
                submission
            };
            let Some(submission) = submission else {
                continue;
            };
            let task_id = submission.task_id.clone();

            let Some(done_tx) = self.completion_tx.lock().unwrap().clone() else {
                break;
            };
            let executor = self.pool_manager.get_available_executor();
            if let Err(err) = executor.submit(submission, done_tx) {
                error!("failed to start task {}: {err}", short(&task_id));
                self.fail_task(&task_id, TaskException::from_error(err.into()));
            }
        }
        debug!("dispatcher stopped");
    }

    /// Resolve a handle with a failure when dispatch itself broke down, so
    /// the caller observes the error instead of waiting forever.
    fn fail_task(&self, task_id: &str, exception: TaskException) {
        let slot = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(task_id)
        };
        if let Some(slot) = slot {
            slot.complete(Err(exception));
        }
    }

    fn bridge_loop(&self, completions: Receiver<TaskCompletion>) {
        while let Ok(completion) = completions.recv() {
            self.relay(completion);
        }
        debug!("bridge stopped");
    }

    fn relay(&self, completion: TaskCompletion) {
        let slot = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(&completion.task_id)
        };
        match completion.outcome {
            ExecutorOutcome::Cancelled => {
                if let Some(slot) = slot {
                    slot.cancel();
                }
            }
            ExecutorOutcome::Finished(outcome) => {
                self.cache.set(&completion.task_id, &outcome);
                if let Some(slot) = slot {
                    slot.complete(outcome);
                }
            }
        }
    }

    pub(crate) fn take_cached(&self, task_id: &str) -> Option<TaskOutcome> {
        self.cache.take(task_id)
    }

    pub(crate) fn peek_cached(&self, task_id: &str) -> Option<TaskOutcome> {
        self.cache.get(task_id)
    }

    pub(crate) fn has_cached(&self, task_id: &str) -> bool {
        self.cache.contains(task_id)
    }

    /// Whether submissions are currently accepted.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The configuration this master runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current engine statistics.
    pub fn get_stats(&self) -> TaskMasterStats {
        let (pending_tasks, active_tasks, avg_queue_wait_seconds) = {
            let state = self.state.lock().unwrap();
            let avg_queue_wait_seconds = if state.dispatched == 0 {
                0.0
            } else {
                state.queue_wait_total.as_secs_f64() / state.dispatched as f64
            };
            (
                state.pending.len(),
                state.active.len(),
                avg_queue_wait_seconds,
            )
        };
        TaskMasterStats {
            pending_tasks,
            active_tasks,
            executors: self.pool_manager.executor_count(),
            memory_cache_size: self.cache.memory_len(),
            avg_queue_wait_seconds,
            cpu_load: self.monitor.cpu_load(),
            memory_load: self.monitor.memory_load(),
            system_load: self.monitor.system_load(),
        }
    }

    /// Drop every memory-tier cache entry.
    pub fn clear_memory_cache(&self) {
        let cleared = self.cache.clear_memory();
        info!("cleared {cleared} items from memory cache");
    }

    /// Sweep disk-tier cache entries older than `max_age`.
    pub fn purge_stale_cache(&self, max_age: Duration) -> TaskmanResult<usize> {
        self.cache.purge_stale(max_age)
    }

    /// Stop the engine. Idempotent.
    ///
    /// With `wait`, blocks until pending and active registries drain or
    /// `timeout` elapses. Remaining handles observe a cancelled slot, so
    /// nobody hangs on a value that will never arrive.
    pub fn shutdown(&self, wait: bool, timeout: Option<Duration>) {
        if wait {
            self.draining.store(true, Ordering::SeqCst);
        }
        if !self.running.swap(false, Ordering::SeqCst) {
            self.draining.store(false, Ordering::SeqCst);
            return;
        }
        info!("shutting down task master");

        if wait {
            let deadline = timeout.map(|t| Instant::now() + t);
            loop {
                let (pending, active) = {
                    let state = self.state.lock().unwrap();
                    (state.pending.len(), state.active.len())
                };
                if pending == 0 && active == 0 {
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    warn!("shutdown timeout reached, forcing shutdown");
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        self.draining.store(false, Ordering::SeqCst);

        // The dispatcher must be gone before the pools close, so a
        // dispatch in flight cannot hand work to a dying executor.
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().take() {
            let _ = dispatcher.join();
        }
        // Dropping the sender lets the bridge drain in-flight completions
        // and exit on its own.
        *self.completion_tx.lock().unwrap() = None;
        drop(self.bridge.lock().unwrap().take());

        self.monitor.stop();
        self.pool_manager.shutdown();
        self.clear_memory_cache();

        {
            let mut state = self.state.lock().unwrap();
            for slot in state.active.values() {
                slot.cancel();
            }
            state.active.clear();
            state.pending.clear();
        }

        info!("task master shutdown complete");
    }
}

fn short(task_id: &str) -> &str {
    &task_id[..task_id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::TaskValue;
    use tempfile::TempDir;

    fn test_master(threads: usize, cpu_workers: usize) -> (TempDir, Arc<TaskMaster>) {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig {
            thread_pool_size: threads,
            cpu_pool_size: cpu_workers,
            cache_dir: Some(tmp.path().to_path_buf()),
            resource_sample_interval_seconds: 0.05,
            ..EngineConfig::default()
        };
        let master = TaskMaster::new(config).unwrap();
        (tmp, master)
    }

    #[test]
    fn test_submit_and_await_result() {
        let (_tmp, master) = test_master(2, 0);

        let task = master
            .submit(TaskKind::Mixed, 0, Job::sync(|| Ok(TaskValue::from(7 * 7))))
            .unwrap();
        assert!(task.task_id().is_some());

        let value = task.await_result().unwrap();
        assert_eq!(value.as_i64(), Some(49));
        assert!(task.duration() > Duration::ZERO);

        // The engine drains: nothing pending, nothing active, cache empty.
        std::thread::sleep(Duration::from_millis(50));
        let stats = master.get_stats();
        assert_eq!(stats.pending_tasks, 0);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.memory_cache_size, 0);
        assert!(
            stats.avg_queue_wait_seconds > 0.0,
            "a dispatched task spent time in the queue"
        );

        master.shutdown(false, None);
    }

    #[test]
    fn test_failures_are_wrapped_and_cached() {
        let (_tmp, master) = test_master(2, 0);

        let task = master
            .submit(
                TaskKind::Io,
                0,
                Job::sync(|| Err(anyhow::anyhow!("boom"))),
            )
            .unwrap();

        let exception = task.exception().unwrap();
        assert_eq!(exception.message(), "boom");
        assert!(task.is_done());
        assert!(!task.is_successful());
        assert!(matches!(task.await_result(), Err(TaskmanError::Task(_))));

        master.shutdown(false, None);
    }

    #[test]
    fn test_opaque_results_flow_through_memory_tier() {
        let (_tmp, master) = test_master(2, 0);

        struct Session {
            user: &'static str,
        }

        let task = master
            .submit(
                TaskKind::Mixed,
                0,
                Job::sync(|| Ok(TaskValue::opaque(Session { user: "admin" }))),
            )
            .unwrap();

        let value = task.await_result().unwrap();
        assert_eq!(value.downcast_ref::<Session>().unwrap().user, "admin");
        // The memory tier entry is consumed by the retrieval.
        assert_eq!(master.get_stats().memory_cache_size, 0);

        master.shutdown(false, None);
    }

    #[test]
    fn test_every_submission_completes_exactly_once_under_promotion() {
        let (_tmp, master) = test_master(4, 0);

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let task = master
                    .submit(TaskKind::Mixed, 0, Job::sync(move || Ok(TaskValue::from(i))))
                    .unwrap();
                // Promotion of queued, dispatched and finished submissions
                // alike must be harmless.
                master.promote_task(task.task_id().unwrap());
                master.promote_task(task.task_id().unwrap());
                task
            })
            .collect();

        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.await_result().unwrap().as_i64(), Some(i as i64));
        }

        std::thread::sleep(Duration::from_millis(50));
        let stats = master.get_stats();
        assert_eq!(stats.pending_tasks, 0);
        assert_eq!(stats.active_tasks, 0);

        master.shutdown(false, None);
    }

    #[test]
    fn test_async_submission() {
        let (_tmp, master) = test_master(2, 0);

        let task = master
            .submit(
                TaskKind::Io,
                0,
                Job::future(|| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(TaskValue::from("from the event loop"))
                }),
            )
            .unwrap();

        assert_eq!(
            task.await_result().unwrap().as_str(),
            Some("from the event loop")
        );
        master.shutdown(false, None);
    }

    #[test]
    fn test_submit_after_shutdown_is_refused() {
        let (_tmp, master) = test_master(2, 0);
        master.shutdown(true, Some(Duration::from_secs(1)));
        assert!(!master.is_running());

        let result = master.submit(TaskKind::Mixed, 0, Job::sync(|| Ok(TaskValue::Null)));
        assert!(matches!(result, Err(TaskmanError::ShuttingDown)));

        // Shutdown is idempotent.
        master.shutdown(true, None);
    }

    #[test]
    fn test_shutdown_cancels_undispatched_work() {
        let (_tmp, master) = test_master(1, 0);

        // One long task occupies the single worker; the rest stay queued.
        let blocker = master
            .submit(
                TaskKind::Mixed,
                0,
                Job::sync(|| {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(TaskValue::Null)
                }),
            )
            .unwrap();
        let queued: Vec<_> = (0..4)
            .map(|_| {
                master
                    .submit(TaskKind::Mixed, 0, Job::sync(|| Ok(TaskValue::Null)))
                    .unwrap()
            })
            .collect();

        master.shutdown(false, None);

        for task in &queued {
            assert!(task.is_done(), "no handle may hang after shutdown");
        }
        let _ = blocker;
    }

    #[test]
    fn test_stats_report_monitor_readings() {
        let (_tmp, master) = test_master(2, 1);
        std::thread::sleep(Duration::from_millis(150));

        let stats = master.get_stats();
        assert_eq!(stats.executors, 1);
        assert_eq!(
            stats.avg_queue_wait_seconds, 0.0,
            "nothing has been dispatched yet"
        );
        assert!((0.0..=1.0).contains(&stats.cpu_load));
        assert!((0.0..=1.0).contains(&stats.memory_load));
        assert!((0.0..=1.0).contains(&stats.system_load));

        master.shutdown(false, None);
    }
}
