//! Job definition: the unit of work accepted by the engine.
//!
//! A [`Job`] captures the user's callable and its arguments at submission
//! time, so the engine never handles argument tuples at the boundary. Sync
//! jobs run directly on a pool worker; async jobs are driven to completion
//! on a per-task current-thread runtime, also on a pool worker.

use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::future::BoxFuture;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::completion::TaskOutcome;
use crate::core::task::TaskException;
use crate::core::value::TaskValue;

/// What a job produces: a value, or an opaque error.
pub type JobResult = anyhow::Result<TaskValue>;

/// Declared workload category of a submission.
///
/// Callers declare the kind; the engine routes on it rather than sniffing
/// the callable. `Cpu`-kind sync jobs are eligible for the dedicated CPU
/// worker pool; everything else runs on the shared thread pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// CPU-bound computation.
    Cpu,
    /// I/O-bound work (network, disk, database).
    Io,
    /// Mixed or unknown workload.
    Mixed,
}

impl Default for TaskKind {
    fn default() -> Self {
        TaskKind::Mixed
    }
}

/// A unit of work: a closure with its arguments already captured.
pub enum Job {
    /// A synchronous closure.
    Sync(Box<dyn FnOnce() -> JobResult + Send + 'static>),
    /// An async closure; produces a future the worker drives to completion.
    Async(Box<dyn FnOnce() -> BoxFuture<'static, JobResult> + Send + 'static>),
}

impl Job {
    /// Wrap a synchronous closure.
    pub fn sync<F>(func: F) -> Self
    where
        F: FnOnce() -> JobResult + Send + 'static,
    {
        Job::Sync(Box::new(func))
    }

    /// Wrap an async closure.
    ///
    /// The future is created lazily on the worker thread, so the closure may
    /// capture non-`Sync` state as long as it is `Send`.
    pub fn future<F, Fut>(func: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = JobResult> + Send + 'static,
    {
        Job::Async(Box::new(move || Box::pin(func()) as BoxFuture<'static, JobResult>))
    }

    /// Whether this job must be driven by an event loop.
    pub fn is_async(&self) -> bool {
        matches!(self, Job::Async(_))
    }

    /// Run the job to completion on the current thread.
    ///
    /// Panics are caught and converted into failure outcomes so a
    /// misbehaving job can never take a pool worker down with it.
    pub(crate) fn run(self) -> TaskOutcome {
        let result = catch_unwind(AssertUnwindSafe(|| match self {
            Job::Sync(func) => func(),
            Job::Async(func) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(anyhow::Error::from)?;
                runtime.block_on(func())
            }
        }));

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                debug!("job failed: {error:#}");
                Err(TaskException::from_error(error))
            }
            Err(payload) => Err(TaskException::from_panic(payload.as_ref())),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Sync(_) => write!(f, "Job::Sync"),
            Job::Async(_) => write!(f, "Job::Async"),
        }
    }
}
