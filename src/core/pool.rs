//! Fixed-size OS-thread worker pool.
//!
//! The pool primitive underneath both the hybrid executor and the direct
//! execution mode. Workers pull thunks from a shared injector channel and
//! report how many of them are busy, which is what executor load is
//! computed from. A panicking thunk is logged and contained; the worker
//! survives.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error};

use crate::error::{TaskmanError, TaskmanResult};

/// A unit of pool work, fully wrapped by the submitting component.
pub type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// Pool of named OS worker threads sharing an injector channel.
pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<Sender<Thunk>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a pool of `size` workers named `{name}-{index}`.
    pub fn new(name: &str, size: usize) -> Self {
        assert!(size > 0, "worker pool size must be greater than 0");

        let (sender, receiver) = channel::<Thunk>();
        let receiver = Arc::new(Mutex::new(receiver));
        let busy = Arc::new(AtomicUsize::new(0));

        let workers = (0..size)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                let busy = Arc::clone(&busy);
                std::thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || Self::worker_loop(receiver, busy))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        debug!("worker pool {name} started with {size} workers");
        Self {
            name: name.to_string(),
            size,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            busy,
        }
    }

    fn worker_loop(receiver: Arc<Mutex<Receiver<Thunk>>>, busy: Arc<AtomicUsize>) {
        loop {
            let thunk = {
                let guard = receiver.lock().unwrap();
                guard.recv()
            };
            let Ok(thunk) = thunk else {
                break; // channel closed: pool is shutting down
            };
            busy.fetch_add(1, Ordering::SeqCst);
            if catch_unwind(AssertUnwindSafe(thunk)).is_err() {
                error!("worker thunk panicked; worker continues");
            }
            busy.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Hand a thunk to the pool.
    ///
    /// Fails once the pool has been shut down.
    pub fn execute(&self, thunk: Thunk) -> TaskmanResult<()> {
        let guard = self.sender.lock().unwrap();
        let sender = guard
            .as_ref()
            .ok_or_else(|| TaskmanError::internal(format!("worker pool {} is closed", self.name)))?;
        sender
            .send(thunk)
            .map_err(|_| TaskmanError::internal(format!("worker pool {} lost its workers", self.name)))
    }

    /// Number of workers currently running a thunk.
    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Total worker count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Utilisation in [0, 1].
    pub fn load(&self) -> f64 {
        (self.busy_count() as f64 / self.size as f64).clamp(0.0, 1.0)
    }

    /// Close the injector channel; with `wait`, join all workers.
    ///
    /// Already-queued thunks still run; with `wait = false` the workers
    /// drain in the background.
    pub fn shutdown(&self, wait: bool) {
        debug!("shutting down worker pool {}", self.name);
        drop(self.sender.lock().unwrap().take());
        if wait {
            let workers = std::mem::take(&mut *self.workers.lock().unwrap());
            for worker in workers {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Make sure workers stop blocking on the channel once the pool goes away.
        drop(self.sender.lock().unwrap().take());
    }
}
