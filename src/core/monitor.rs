//! System resource monitor.
//!
//! A background sampler reads system-wide CPU and memory utilisation on a
//! fixed cadence and publishes them as lock-free floats. Readers get a
//! possibly stale value, never a lock. Monitoring must never take the
//! process down: sampling problems are logged and swallowed.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use sysinfo::System;

/// Background sampler exposing CPU, memory and combined system load.
pub struct ResourceMonitor {
    interval: Duration,
    cpu_percent: Arc<AtomicU32>,
    memory_percent: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    /// Create a monitor sampling every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            cpu_percent: Arc::new(AtomicU32::new(0)),
            memory_percent: Arc::new(AtomicU32::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
            sampler: Mutex::new(None),
        }
    }

    /// Start the background sampler. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.stop.0.lock().unwrap() = false;

        let interval = self.interval;
        let cpu = Arc::clone(&self.cpu_percent);
        let memory = Arc::clone(&self.memory_percent);
        let running = Arc::clone(&self.running);
        let stop = Arc::clone(&self.stop);

        let handle = std::thread::Builder::new()
            .name("taskman-monitor".to_string())
            .spawn(move || {
                let mut system = System::new();
                // First CPU refresh only establishes the baseline.
                system.refresh_cpu_usage();
                while running.load(Ordering::SeqCst) {
                    let (lock, cond) = &*stop;
                    let guard = lock.lock().unwrap();
                    let (guard, _) = cond
                        .wait_timeout_while(guard, interval, |stopped| !*stopped)
                        .unwrap();
                    if *guard {
                        break;
                    }
                    drop(guard);
                    Self::sample(&mut system, &cpu, &memory);
                }
                debug!("resource monitor stopped");
            })
            .expect("failed to spawn monitor thread");

        *self.sampler.lock().unwrap() = Some(handle);
        debug!("resource monitor started (interval {interval:?})");
    }

    fn sample(system: &mut System, cpu: &AtomicU32, memory: &AtomicU32) {
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_usage();
        if cpu_percent.is_finite() {
            cpu.store(cpu_percent.clamp(0.0, 100.0).to_bits(), Ordering::Relaxed);
        } else {
            warn!("resource sampling produced a non-finite CPU reading");
        }

        let total = system.total_memory();
        if total > 0 {
            let memory_percent = (system.used_memory() as f32 / total as f32) * 100.0;
            memory.store(
                memory_percent.clamp(0.0, 100.0).to_bits(),
                Ordering::Relaxed,
            );
        } else {
            warn!("resource sampling reported zero total memory");
        }
    }

    /// Stop the sampler and join it. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let (lock, cond) = &*self.stop;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        if let Some(handle) = self.sampler.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// CPU utilisation in [0, 1].
    pub fn cpu_load(&self) -> f64 {
        f64::from(f32::from_bits(self.cpu_percent.load(Ordering::Relaxed))) / 100.0
    }

    /// Memory utilisation in [0, 1].
    pub fn memory_load(&self) -> f64 {
        f64::from(f32::from_bits(self.memory_percent.load(Ordering::Relaxed))) / 100.0
    }

    /// Combined system load: the worse of CPU and memory utilisation.
    pub fn system_load(&self) -> f64 {
        self.cpu_load().max(self.memory_load())
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
