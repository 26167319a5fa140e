//! Value type flowing through the execution engine.
//!
//! Jobs produce a [`TaskValue`]; the engine relays it to handles and to the
//! result cache without ever inspecting its meaning. Values come in two
//! flavours: JSON payloads, which can be written to the disk cache tier,
//! and opaque in-process values, which are confined to the memory tier.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::TaskmanResult;

/// A value produced by a task.
///
/// `Json` (and `Null`) values are serialisable and therefore disk-cacheable;
/// `Opaque` values can only live in the in-memory fallback tier.
#[derive(Clone)]
pub enum TaskValue {
    /// No meaningful value (a side-effect-only task).
    Null,
    /// A serialisable JSON payload.
    Json(serde_json::Value),
    /// An arbitrary in-process value, shared by reference.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl TaskValue {
    /// Wrap any serialisable value as a JSON payload.
    pub fn json<T: Serialize>(value: T) -> TaskmanResult<Self> {
        Ok(TaskValue::Json(serde_json::to_value(value)?))
    }

    /// Wrap an arbitrary in-process value.
    ///
    /// Opaque values never reach the disk cache tier.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        TaskValue::Opaque(Arc::new(value))
    }

    /// Whether this value can be written to the disk cache tier.
    pub fn is_serialisable(&self) -> bool {
        !matches!(self, TaskValue::Opaque(_))
    }

    /// The JSON payload, if this is a `Json` value.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            TaskValue::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Borrow an opaque value back as its concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            TaskValue::Opaque(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Integer shortcut for `Json` payloads.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_json().and_then(serde_json::Value::as_i64)
    }

    /// String shortcut for `Json` payloads.
    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(serde_json::Value::as_str)
    }

    /// Boolean shortcut for `Json` payloads.
    pub fn as_bool(&self) -> Option<bool> {
        self.as_json().and_then(serde_json::Value::as_bool)
    }
}

impl fmt::Debug for TaskValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskValue::Null => write!(f, "Null"),
            TaskValue::Json(value) => write!(f, "Json({value})"),
            TaskValue::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

impl From<serde_json::Value> for TaskValue {
    fn from(value: serde_json::Value) -> Self {
        TaskValue::Json(value)
    }
}

impl From<()> for TaskValue {
    fn from(_: ()) -> Self {
        TaskValue::Null
    }
}

impl From<i64> for TaskValue {
    fn from(value: i64) -> Self {
        TaskValue::Json(value.into())
    }
}

impl From<i32> for TaskValue {
    fn from(value: i32) -> Self {
        TaskValue::Json(value.into())
    }
}

impl From<f64> for TaskValue {
    fn from(value: f64) -> Self {
        TaskValue::Json(value.into())
    }
}

impl From<bool> for TaskValue {
    fn from(value: bool) -> Self {
        TaskValue::Json(value.into())
    }
}

impl From<&str> for TaskValue {
    fn from(value: &str) -> Self {
        TaskValue::Json(value.into())
    }
}

impl From<String> for TaskValue {
    fn from(value: String) -> Self {
        TaskValue::Json(value.into())
    }
}
