//! Notification subsystem configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for publishing and receiving notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// History kept per topic for catch-up requests
    #[serde(default = "default_buffer_size")]
    pub default_buffer_size: usize,

    /// Maximum notifications handed to a consumer at once
    #[serde(default = "default_batch_size")]
    pub batch_max_size: usize,

    /// Maximum time a notification waits in a batch
    #[serde(default = "default_batch_latency")]
    pub batch_max_latency_ms: u64,

    /// How long a topic may stay in catch-up mode before it is flagged stale
    #[serde(default = "default_catch_up_timeout")]
    pub catch_up_timeout_secs: u64,

    /// Budget for subscribe / fetch calls against other nodes
    #[serde(default = "default_remote_call_timeout")]
    pub remote_call_timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_buffer_size: default_buffer_size(),
            batch_max_size: default_batch_size(),
            batch_max_latency_ms: default_batch_latency(),
            catch_up_timeout_secs: default_catch_up_timeout(),
            remote_call_timeout_secs: default_remote_call_timeout(),
        }
    }
}

impl NotificationConfig {
    pub fn batch_max_latency(&self) -> Duration {
        Duration::from_millis(self.batch_max_latency_ms)
    }

    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_secs(self.catch_up_timeout_secs)
    }

    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_call_timeout_secs)
    }
}

// Default value helpers
fn default_buffer_size() -> usize {
    1000
}

fn default_batch_size() -> usize {
    2000
}

fn default_batch_latency() -> u64 {
    200
}

fn default_catch_up_timeout() -> u64 {
    30
}

fn default_remote_call_timeout() -> u64 {
    10
}
