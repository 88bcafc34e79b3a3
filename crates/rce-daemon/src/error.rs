//! Daemon error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors of the node daemon
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another process runs on the same profile
    #[error("Failed to lock profile {}", .0.display())]
    ProfileLocked(PathBuf),

    #[error("Invalid configuration sequence in {path}: {source}")]
    ConfigurationSequence {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Instance(#[from] rce_instance::InstanceManagementError),

    #[error(transparent)]
    Workflow(#[from] rce_workflow::WorkflowExecutionError),

    #[error(transparent)]
    WorkflowFile(#[from] rce_workflow::WorkflowFileError),

    #[error(transparent)]
    WorkflowContext(#[from] rce_types::ContextBuildError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for DaemonError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Result type for the daemon
pub type DaemonResult<T> = std::result::Result<T, DaemonError>;
