//! Engine configuration types for Stepline.
//!
//! `EngineConfig` controls the orchestrator's concurrency gate, default
//! step timeout, and store retention policy. All fields have sensible
//! defaults, so an empty config file (or `EngineConfig::default()`) yields
//! a working engine.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of workflows executing at once. Exceeding the limit
    /// fails the execute call immediately rather than queuing.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Step timeout applied when a step declares none, in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// How many terminal workflows the store retains, ordered by completion
    /// time. Older ones are purged by the cleanup task.
    #[serde(default = "default_retention_keep")]
    pub retention_keep: usize,

    /// Interval between retention cleanup sweeps, in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_max_concurrent_workflows() -> usize {
    10
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_retention_keep() -> usize {
    100
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            default_step_timeout_secs: default_step_timeout_secs(),
            retention_keep: default_retention_keep(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}
