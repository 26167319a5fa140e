//! Disk tier of the result cache.
//!
//! One JSON blob per task id under the cache directory. Entries have no
//! TTL — they are short-lived because retrieval deletes them — but the
//! tier enforces a least-recently-stored entry cap and offers a stale-file
//! sweep for entries left behind by callers that never collected their
//! result.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::core::completion::TaskOutcome;
use crate::core::task::TaskException;
use crate::core::value::TaskValue;
use crate::error::{TaskmanError, TaskmanResult};

/// Serialised form of a cached outcome.
#[derive(Debug, Serialize, Deserialize)]
enum CacheRecord {
    /// A successful result; `None` encodes a null value.
    Value(Option<serde_json::Value>),
    /// A failure, cached just like a success.
    Failure(TaskException),
}

impl CacheRecord {
    fn try_from_outcome(outcome: &TaskOutcome) -> TaskmanResult<Self> {
        match outcome {
            Ok(TaskValue::Json(value)) => Ok(CacheRecord::Value(Some(value.clone()))),
            Ok(TaskValue::Null) => Ok(CacheRecord::Value(None)),
            Ok(TaskValue::Opaque(_)) => Err(TaskmanError::cache(
                "opaque values cannot be serialised to the disk tier",
            )),
            Err(exception) => Ok(CacheRecord::Failure(exception.clone())),
        }
    }

    fn into_outcome(self) -> TaskOutcome {
        match self {
            CacheRecord::Value(Some(value)) => Ok(TaskValue::Json(value)),
            CacheRecord::Value(None) => Ok(TaskValue::Null),
            CacheRecord::Failure(exception) => Err(exception),
        }
    }
}

/// File-per-entry disk cache keyed by task id.
pub struct DiskCache {
    dir: PathBuf,
    max_entries: usize,
    lock: Mutex<()>,
}

impl DiskCache {
    /// Open (and create) the cache directory.
    pub fn new(dir: PathBuf, max_entries: usize) -> TaskmanResult<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_entries,
            lock: Mutex::new(()),
        })
    }

    fn entry_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    /// Store an outcome, evicting the oldest entries past the cap.
    ///
    /// Fails for outcomes that cannot be serialised; the caller is expected
    /// to fall back to the memory tier.
    pub fn set(&self, task_id: &str, outcome: &TaskOutcome) -> TaskmanResult<()> {
        let record = CacheRecord::try_from_outcome(outcome)?;
        let payload = serde_json::to_vec(&record)?;

        let _guard = self.lock.lock().unwrap();
        fs::write(self.entry_path(task_id), payload)?;
        self.evict_locked();
        Ok(())
    }

    /// Read an outcome back. Unreadable entries are dropped and reported
    /// as a miss.
    pub fn get(&self, task_id: &str) -> Option<TaskOutcome> {
        let path = self.entry_path(task_id);
        let _guard = self.lock.lock().unwrap();
        let payload = fs::read(&path).ok()?;
        match serde_json::from_slice::<CacheRecord>(&payload) {
            Ok(record) => Some(record.into_outcome()),
            Err(error) => {
                warn!("dropping unreadable cache entry {}: {error}", path.display());
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Remove an entry; returns whether one existed.
    pub fn delete(&self, task_id: &str) -> bool {
        let _guard = self.lock.lock().unwrap();
        fs::remove_file(self.entry_path(task_id)).is_ok()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        let _guard = self.lock.lock().unwrap();
        self.json_entries().len()
    }

    /// Whether the tier is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove entries older than `max_age`; returns how many went.
    pub fn purge_stale(&self, max_age: Duration) -> TaskmanResult<usize> {
        let _guard = self.lock.lock().unwrap();
        let now = SystemTime::now();
        let mut removed = 0;
        for (path, modified) in self.json_entries() {
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                if fs::remove_file(&path).is_ok() {
                    debug!("purged stale cache entry {}", path.display());
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Least-recently-stored eviction down to the entry cap.
    fn evict_locked(&self) {
        let mut entries = self.json_entries();
        if entries.len() <= self.max_entries {
            return;
        }
        entries.sort_by_key(|(_, modified)| *modified);
        let excess = entries.len() - self.max_entries;
        for (path, _) in entries.into_iter().take(excess) {
            if fs::remove_file(&path).is_ok() {
                debug!("evicted cache entry {}", path.display());
            }
        }
    }

    fn json_entries(&self) -> Vec<(PathBuf, SystemTime)> {
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        dir.filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((path, modified))
        })
        .collect()
    }

    /// The directory entries live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
