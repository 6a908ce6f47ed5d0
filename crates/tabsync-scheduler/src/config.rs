//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing parameters for a [`ProcessScheduler`](crate::ProcessScheduler).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Name used in log lines.
    #[serde(default = "default_name")]
    pub name: String,
    /// Minimum gap between the starts of two scheduled runs (in milliseconds).
    pub throttle_ms: u64,
    /// Upper bound on waiting for the host to report idle (in milliseconds).
    pub idle_timeout_ms: u64,
}

fn default_name() -> String {
    "process".to_string()
}

impl SchedulerConfig {
    /// Minimum gap between the starts of two scheduled executions.
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    /// Longest a scheduled execution waits for an idle slot.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            throttle_ms: 0,
            idle_timeout_ms: 1000,
        }
    }
}

/// Builder for scheduler configuration.
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn throttle(mut self, ms: u64) -> Self {
        self.config.throttle_ms = ms;
        self
    }

    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.config.idle_timeout_ms = ms;
        self
    }

    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}

impl Default for SchedulerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
