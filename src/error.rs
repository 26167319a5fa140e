//! Error types for the taskman execution engine.
//!
//! This module defines the `TaskmanError` enum covering all error conditions
//! that can surface from the engine: submission validation, wait timeouts,
//! shutdown refusals, cache failures, and task failures carried as
//! [`TaskException`] values.
//!
//! It also provides helper methods to construct errors and the stable kind
//! names used when a failure is converted into a cacheable exception value.
use thiserror::Error;

use crate::core::task::TaskException;

/// Represents all possible errors surfaced by the taskman engine.
///
/// Each variant provides specific context to facilitate debugging and
/// user-friendly reporting.
///
/// # Examples
///
/// ```rust
/// use taskman::error::{TaskmanError, TaskmanResult};
///
/// fn example() -> TaskmanResult<()> {
///     Err(TaskmanError::validation("race requires at least one task"))
/// }
/// ```
#[derive(Error, Debug)]
pub enum TaskmanError {
    /// A caller-side misuse detected synchronously at submission time.
    ///
    /// # Common Causes
    /// - An async job submitted to the CPU worker pool
    /// - An empty task list passed to `race`
    /// - An out-of-range preferred task index
    #[error("Validation error: {message}")]
    Validation {
        /// Description of the misuse
        message: String,
    },

    /// A wait exceeded its time budget.
    ///
    /// The underlying task keeps running; wait timeouts never cancel work.
    #[error("Timed out after {seconds:.3} seconds")]
    Timeout {
        /// The exceeded budget, in seconds
        seconds: f64,
    },

    /// The waited-on handle was cancelled before producing a value.
    #[error("Task was cancelled")]
    Cancelled,

    /// The engine is shutting down and refuses new submissions.
    #[error("Task master is shutting down, cannot submit tasks")]
    ShuttingDown,

    /// A task's job returned (or panicked with) an error.
    ///
    /// Surfaced only by the raising retrieval variants; the non-raising
    /// variants return the [`TaskException`] as a value instead.
    #[error("Task failed: {0}")]
    Task(#[from] TaskException),

    /// Result cache failure (serialisation refused, unreadable entry).
    #[error("Cache error: {message}")]
    Cache {
        /// Description of the cache failure
        message: String,
    },

    /// Configuration error due to invalid or missing settings.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O operation failed, typically in the disk cache tier.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialisation or deserialisation failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal engine failure that should not normally reach callers.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal failure
        message: String,
    },
}

/// Specialized `Result` type for taskman operations.
pub type TaskmanResult<T> = Result<T, TaskmanError>;

impl TaskmanError {
    /// Create a validation error with the given message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use taskman::error::TaskmanError;
    /// let err = TaskmanError::validation("empty task list");
    /// assert_eq!(err.to_string(), "Validation error: empty task list");
    /// ```
    pub fn validation<S: Into<String>>(message: S) -> Self {
        TaskmanError::Validation {
            message: message.into(),
        }
    }

    /// Create a timeout error for the given elapsed budget.
    pub fn timeout(budget: std::time::Duration) -> Self {
        TaskmanError::Timeout {
            seconds: budget.as_secs_f64(),
        }
    }

    /// Create a cache error with the given message.
    pub fn cache<S: Into<String>>(message: S) -> Self {
        TaskmanError::Cache {
            message: message.into(),
        }
    }

    /// Create an internal error with the given message.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        TaskmanError::Internal {
            message: message.into(),
        }
    }

    /// Stable kind name for this error variant.
    ///
    /// Used as the `kind` of a [`TaskException`] when an engine error is
    /// converted into a cacheable failure value.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskmanError::Validation { .. } => "Validation",
            TaskmanError::Timeout { .. } => "Timeout",
            TaskmanError::Cancelled => "Cancelled",
            TaskmanError::ShuttingDown => "ShuttingDown",
            TaskmanError::Task(_) => "Task",
            TaskmanError::Cache { .. } => "Cache",
            TaskmanError::Config(_) => "Config",
            TaskmanError::Io(_) => "Io",
            TaskmanError::Serialization(_) => "Serialization",
            TaskmanError::Internal { .. } => "Internal",
        }
    }

    /// Whether this error is a wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskmanError::Timeout { .. })
    }
}
