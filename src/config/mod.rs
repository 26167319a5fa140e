//! Configuration management module for taskman.
//!
//! This module defines [`EngineConfig`], the set of knobs recognised by the
//! execution engine, together with defaults, environment-variable loading
//! and validation.
//!
//! Every field can be overridden from the process environment using the
//! upper-cased field name (`THREAD_POOL_SIZE`, `CPU_POOL_SIZE`,
//! `EXECUTOR_LOAD_SPAWN_THRESHOLD`, ...). Values are layered in order:
//! built-in defaults first, then environment overrides.
//!
//! # Examples
//!
//! ```rust
//! use taskman::config::EngineConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load()?;
//! assert!(config.thread_pool_size > 0);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TaskmanError, TaskmanResult};

/// Engine configuration.
///
/// All durations are expressed in seconds so they can be provided as plain
/// environment variables; fractional values are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Thread count of the base hybrid executor's thread pool.
    pub thread_pool_size: usize,
    /// Worker count of the base hybrid executor's CPU pool; 0 disables it.
    pub cpu_pool_size: usize,
    /// Executor load above which the pool manager spawns a new executor.
    pub executor_load_spawn_threshold: f64,
    /// Seconds of inactivity after which an extra executor is reclaimed.
    pub executor_idle_reclaim_seconds: f64,
    /// Interval of the pool manager's idle-reclaim sweep, in seconds.
    pub pool_manager_cleanup_interval_seconds: f64,
    /// Interval of the resource monitor's sampler, in seconds.
    pub resource_sample_interval_seconds: f64,
    /// Default wait budget applied by convenience wait helpers, in seconds.
    pub task_timeout_default_seconds: f64,
    /// Whether non-serialisable results fall back to the memory cache tier.
    pub memory_cache_fallback_enabled: bool,
    /// Directory of the disk cache tier; defaults to the user cache dir.
    pub cache_dir: Option<PathBuf>,
    /// Entry cap of the disk cache tier (least-recently-stored eviction).
    pub disk_cache_max_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cores = num_cpus::get();
        Self {
            thread_pool_size: (cores * 2).max(4),
            cpu_pool_size: (cores / 2).max(1),
            executor_load_spawn_threshold: 0.8,
            executor_idle_reclaim_seconds: 120.0,
            pool_manager_cleanup_interval_seconds: 30.0,
            resource_sample_interval_seconds: 1.0,
            task_timeout_default_seconds: 30.0,
            memory_cache_fallback_enabled: true,
            cache_dir: None,
            disk_cache_max_entries: 1024,
        }
    }
}

impl EngineConfig {
    /// Load the configuration: built-in defaults overridden by environment
    /// variables.
    pub fn load() -> TaskmanResult<Self> {
        Self::compose(config::Environment::default().try_parsing(true))
    }

    /// Build a configuration from the defaults plus the given environment
    /// source. Split out so tests can inject a synthetic environment.
    pub(crate) fn compose(env: config::Environment) -> TaskmanResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(env)
            .build()?;
        let cfg: EngineConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration values for correctness.
    pub fn validate(&self) -> TaskmanResult<()> {
        if self.thread_pool_size == 0 {
            return Err(TaskmanError::validation(
                "thread_pool_size must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.executor_load_spawn_threshold)
            || self.executor_load_spawn_threshold == 0.0
        {
            return Err(TaskmanError::validation(
                "executor_load_spawn_threshold must be within (0, 1]",
            ));
        }
        if self.resource_sample_interval_seconds <= 0.0 {
            return Err(TaskmanError::validation(
                "resource_sample_interval_seconds must be greater than 0",
            ));
        }
        if self.pool_manager_cleanup_interval_seconds <= 0.0 {
            return Err(TaskmanError::validation(
                "pool_manager_cleanup_interval_seconds must be greater than 0",
            ));
        }
        if self.executor_idle_reclaim_seconds < 0.0 {
            return Err(TaskmanError::validation(
                "executor_idle_reclaim_seconds must not be negative",
            ));
        }
        if self.task_timeout_default_seconds <= 0.0 {
            return Err(TaskmanError::validation(
                "task_timeout_default_seconds must be greater than 0",
            ));
        }
        if self.disk_cache_max_entries == 0 {
            return Err(TaskmanError::validation(
                "disk_cache_max_entries must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Spawn-threshold accessor kept alongside the duration helpers.
    pub fn spawn_threshold(&self) -> f64 {
        self.executor_load_spawn_threshold
    }

    /// Idle threshold after which an extra executor may be reclaimed.
    pub fn idle_reclaim(&self) -> Duration {
        Duration::from_secs_f64(self.executor_idle_reclaim_seconds)
    }

    /// Interval between idle-reclaim sweeps.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs_f64(self.pool_manager_cleanup_interval_seconds)
    }

    /// Interval between resource samples.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(self.resource_sample_interval_seconds)
    }

    /// Default wait budget for convenience helpers.
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.task_timeout_default_seconds)
    }

    /// Resolved disk cache directory.
    ///
    /// Falls back to the platform cache directory, then the temp dir.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("taskman")
        })
    }
}
