//! Two-tier result cache keyed by task id.
//!
//! The disk tier is primary: serialisable outcomes are written there so
//! completed work survives unreferenced handles cheaply. Outcomes the disk
//! tier refuses (opaque values) fall back to an in-memory map. Retrieval
//! consumes: the first read of an entry removes it from both tiers.
//!
//! # Usage
//!
//! ```rust,ignore
//! let cache = ResultCache::new(&config)?;
//! cache.set("task-id", &outcome);
//! let first = cache.take("task-id");   // Some(outcome), entry gone
//! let second = cache.take("task-id");  // None
//! ```

pub mod disk;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;

pub use disk::DiskCache;

use crate::config::EngineConfig;
use crate::core::completion::TaskOutcome;
use crate::error::TaskmanResult;

/// Façade over the disk tier and the in-memory fallback tier.
pub struct ResultCache {
    disk: DiskCache,
    memory: Mutex<HashMap<String, TaskOutcome>>,
    memory_fallback: bool,
}

impl ResultCache {
    /// Build the cache as configured.
    pub fn new(config: &EngineConfig) -> TaskmanResult<Self> {
        let disk = DiskCache::new(config.resolved_cache_dir(), config.disk_cache_max_entries)?;
        Ok(Self::with_disk(disk, config.memory_cache_fallback_enabled))
    }

    /// Build the cache around an existing disk tier.
    pub fn with_disk(disk: DiskCache, memory_fallback: bool) -> Self {
        Self {
            disk,
            memory: Mutex::new(HashMap::new()),
            memory_fallback,
        }
    }

    /// Store an outcome: disk tier first, memory tier as fallback.
    pub fn set(&self, task_id: &str, outcome: &TaskOutcome) {
        match self.disk.set(task_id, outcome) {
            Ok(()) => debug!("cached task {} result to disk", short(task_id)),
            Err(error) => {
                if self.memory_fallback {
                    debug!(
                        "disk tier refused task {} ({error}); falling back to memory",
                        short(task_id)
                    );
                    self.memory
                        .lock()
                        .unwrap()
                        .insert(task_id.to_string(), outcome.clone());
                } else {
                    debug!(
                        "disk tier refused task {} ({error}); memory fallback disabled",
                        short(task_id)
                    );
                }
            }
        }
    }

    /// Peek at a cached outcome without consuming it.
    pub fn get(&self, task_id: &str) -> Option<TaskOutcome> {
        if let Some(outcome) = self.memory.lock().unwrap().get(task_id) {
            debug!("memory cache hit for task {}", short(task_id));
            return Some(outcome.clone());
        }
        let outcome = self.disk.get(task_id);
        if outcome.is_some() {
            debug!("disk cache hit for task {}", short(task_id));
        }
        outcome
    }

    /// Consume a cached outcome: the entry leaves both tiers.
    pub fn take(&self, task_id: &str) -> Option<TaskOutcome> {
        let from_memory = self.memory.lock().unwrap().remove(task_id);
        if let Some(outcome) = from_memory {
            self.disk.delete(task_id);
            return Some(outcome);
        }
        let from_disk = self.disk.get(task_id);
        if from_disk.is_some() {
            self.disk.delete(task_id);
        }
        from_disk
    }

    /// Remove an entry from both tiers.
    pub fn delete(&self, task_id: &str) {
        self.memory.lock().unwrap().remove(task_id);
        self.disk.delete(task_id);
    }

    /// Whether either tier holds an entry for this id.
    pub fn contains(&self, task_id: &str) -> bool {
        if self.memory.lock().unwrap().contains_key(task_id) {
            return true;
        }
        self.disk.get(task_id).is_some()
    }

    /// Entry count of the memory tier.
    pub fn memory_len(&self) -> usize {
        self.memory.lock().unwrap().len()
    }

    /// Drop every memory-tier entry; returns how many there were.
    pub fn clear_memory(&self) -> usize {
        let mut memory = self.memory.lock().unwrap();
        let count = memory.len();
        memory.clear();
        count
    }

    /// Sweep disk entries older than `max_age`.
    pub fn purge_stale(&self, max_age: Duration) -> TaskmanResult<usize> {
        self.disk.purge_stale(max_age)
    }
}

fn short(task_id: &str) -> &str {
    &task_id[..task_id.len().min(8)]
}
