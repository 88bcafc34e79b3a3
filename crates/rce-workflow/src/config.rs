//! Workflow execution configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for controllers and the execution service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionConfig {
    /// Interval of IS_ALIVE notifications for active workflows
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Budget for calls against controllers on other nodes
    #[serde(default = "default_remote_call_timeout")]
    pub remote_call_timeout_secs: u64,

    /// History kept on each workflow state topic
    #[serde(default = "default_state_buffer_size")]
    pub state_topic_buffer_size: usize,
}

impl Default for WorkflowExecutionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            remote_call_timeout_secs: default_remote_call_timeout(),
            state_topic_buffer_size: default_state_buffer_size(),
        }
    }
}

impl WorkflowExecutionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_call_timeout_secs)
    }
}

fn default_heartbeat_interval() -> u64 {
    6
}

fn default_remote_call_timeout() -> u64 {
    10
}

fn default_state_buffer_size() -> usize {
    100
}
