//! Taskman library root.

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub type Result<T> = error::TaskmanResult<T>;

pub use crate::core::{
    ExecutionMode, Job, ParallelScope, Task, TaskExecutor, TaskException, TaskKind, TaskMaster,
    TaskValue, Tasks,
};
