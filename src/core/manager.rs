//! Dynamic pool manager: scales hybrid executors up and down.
//!
//! One executor always exists. When every executor is heavily loaded a new,
//! progressively smaller one is spawned, which doubles as backpressure:
//! each additional executor adds less capacity than the last. A background
//! sweep reclaims executors that have been idle past the configured
//! threshold, never touching the first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::core::hybrid::HybridExecutor;

/// Owns and scales the set of [`HybridExecutor`]s.
pub struct DynamicPoolManager {
    base_threads: usize,
    base_cpu_workers: usize,
    spawn_threshold: f64,
    idle_threshold: Duration,
    executors: Mutex<Vec<Arc<HybridExecutor>>>,
    spawned_total: AtomicUsize,
    stop: Arc<(Mutex<bool>, Condvar)>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DynamicPoolManager {
    /// Create a manager with one base-sized executor and start the
    /// idle-reclaim sweep.
    pub fn new(
        base_threads: usize,
        base_cpu_workers: usize,
        spawn_threshold: f64,
        idle_threshold: Duration,
        cleanup_interval: Duration,
    ) -> Arc<Self> {
        assert!(base_threads > 0, "base_threads must be greater than 0");

        let manager = Arc::new(Self {
            base_threads,
            base_cpu_workers,
            spawn_threshold,
            idle_threshold,
            executors: Mutex::new(vec![Arc::new(HybridExecutor::new(
                base_threads,
                base_cpu_workers,
            ))]),
            spawned_total: AtomicUsize::new(1),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
            sweeper: Mutex::new(None),
        });

        let sweep_target = Arc::clone(&manager);
        let stop = Arc::clone(&manager.stop);
        let handle = std::thread::Builder::new()
            .name("taskman-pool-sweeper".to_string())
            .spawn(move || {
                loop {
                    let (lock, cond) = &*stop;
                    let guard = lock.lock().unwrap();
                    let (guard, _) = cond
                        .wait_timeout_while(guard, cleanup_interval, |stopped| !*stopped)
                        .unwrap();
                    if *guard {
                        break;
                    }
                    drop(guard);
                    sweep_target.cleanup_idle_executors();
                }
                debug!("pool manager sweeper stopped");
            })
            .expect("failed to spawn pool sweeper thread");
        *manager.sweeper.lock().unwrap() = Some(handle);

        manager
    }

    /// Pick the least-loaded executor, spawning a new one when the best
    /// candidate is already past the spawn threshold.
    pub fn get_available_executor(&self) -> Arc<HybridExecutor> {
        let mut executors = self.executors.lock().unwrap();
        let best = executors
            .iter()
            .min_by(|a, b| {
                a.get_load()
                    .partial_cmp(&b.get_load())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned();

        match best {
            Some(executor) if executor.get_load() <= self.spawn_threshold => executor,
            _ => self.spawn_locked(&mut executors),
        }
    }

    /// Spawn an additional executor.
    ///
    /// Sized down with each existing executor, so scaling out is
    /// deliberately sub-linear.
    pub fn spawn_new_executor(&self) -> Arc<HybridExecutor> {
        let mut executors = self.executors.lock().unwrap();
        self.spawn_locked(&mut executors)
    }

    fn spawn_locked(&self, executors: &mut Vec<Arc<HybridExecutor>>) -> Arc<HybridExecutor> {
        let divisor = executors.len() + 1;
        let threads = (self.base_threads / divisor).max(2);
        let cpu_workers = if self.base_cpu_workers == 0 {
            0
        } else {
            (self.base_cpu_workers / divisor).max(1)
        };

        let executor = Arc::new(HybridExecutor::new(threads, cpu_workers));
        executors.push(Arc::clone(&executor));
        let number = self.spawned_total.fetch_add(1, Ordering::SeqCst) + 1;
        info!("spawned executor #{number} (threads={threads}, cpu_workers={cpu_workers})");
        executor
    }

    /// Reap idle executors, always keeping the first one alive.
    pub fn cleanup_idle_executors(&self) {
        let mut executors = self.executors.lock().unwrap();
        if executors.len() <= 1 {
            return;
        }

        let mut kept = vec![executors[0].clone()];
        for executor in executors.iter().skip(1) {
            if executor.is_idle(self.idle_threshold) {
                executor.shutdown(false);
                info!("reclaimed idle executor");
            } else {
                kept.push(executor.clone());
            }
        }
        *executors = kept;
    }

    /// Current executor count.
    pub fn executor_count(&self) -> usize {
        self.executors.lock().unwrap().len()
    }

    /// Stop the sweep, shut every executor down and clear the list.
    pub fn shutdown(&self) {
        info!("shutting down pool manager");
        {
            let (lock, cond) = &*self.stop;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            if handle.join().is_err() {
                warn!("pool sweeper thread panicked during shutdown");
            }
        }

        let mut executors = self.executors.lock().unwrap();
        for executor in executors.iter() {
            executor.shutdown(false);
        }
        executors.clear();
    }
}
