//! Error types for instance management

use crate::operations::OperationReport;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Failures of the process-level start/stop machinery
#[derive(Debug, Error)]
pub enum InstanceOperationError {
    /// The management lock of a profile stayed taken for the whole retry budget
    #[error("Could not acquire the management lock of profile '{profile}' within {waited_ms}ms")]
    LockContention { profile: String, waited_ms: u64 },

    #[error("Instance executable not found at {0}")]
    ExecutableMissing(PathBuf),

    /// Releasing or deleting a lock file failed; the failure of the
    /// operation itself, if any, is kept as well
    #[error("Failed to release lock of profile '{profile}': {source}{}", .original.as_ref().map(|e| format!(" (after: {e})")).unwrap_or_default())]
    LockRelease {
        profile: String,
        #[source]
        source: std::io::Error,
        original: Option<Box<InstanceOperationError>>,
    },

    /// The task running a batch panicked or was aborted
    #[error("Instance operation was interrupted: {0}")]
    Interrupted(String),

    /// A failure shared by all callers of a coalesced batch
    #[error(transparent)]
    Batch(Arc<InstanceOperationError>),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InstanceOperationError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Lock contention is worth retrying later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockContention { .. } => true,
            Self::Batch(inner) => inner.is_retryable(),
            _ => false,
        }
    }
}

/// Failures while editing an instance configuration file
#[derive(Debug, Error)]
pub enum InstanceConfigurationError {
    #[error("Failed to access configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration entry '{0}' is not a JSON object")]
    NotAnObject(String),

    #[error("Couldn't remove {kind} '{name}' as it isn't present in the current configuration")]
    EntryNotPresent { kind: &'static str, name: String },

    #[error("Resetting the configuration or applying a template must take place *before* applying any other configuration commands ('{operation}' found at position {position})")]
    MisplacedFirstOperation {
        operation: &'static str,
        position: usize,
    },

    #[error("There must be at least one configuration step to perform")]
    EmptySequence,

    #[error("Template '{0}' has no configuration file")]
    TemplateNotFound(String),

    #[error("Instance management SSH access requires a password hash")]
    MissingCredentials,
}

/// Errors raised by the instance management service
#[derive(Debug, Error)]
pub enum InstanceManagementError {
    /// Instance management could not be initialized from its configuration
    #[error("Instance management disabled: {0}")]
    Disabled(String),

    #[error("Malformed id: {0}")]
    MalformedId(String),

    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("Installation with id {0} does not exist")]
    InstallationNotFound(String),

    #[error("Instance with ID {0} not found.")]
    InstanceNotFound(String),

    #[error("Instance with ID {0} currently in use. To stop it use 'im stop {0}'.")]
    InstanceInUse(String),

    #[error("Cannot replace installation {0} because instances are currently running using this installation. Stop the instances or try the \"im reinstall\" command instead.")]
    InstallationRunning(String),

    #[error("Unable to find new version for '{0}'")]
    VersionUnavailable(String),

    /// Some items of a start/stop batch did not succeed
    #[error("{operation} failed for some instances: {}", .report.failure_summary())]
    BatchFailed {
        operation: &'static str,
        report: OperationReport,
    },

    #[error(transparent)]
    Operation(#[from] InstanceOperationError),

    #[error(transparent)]
    Configuration(#[from] InstanceConfigurationError),

    #[error("Download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid installation package: {0}")]
    Package(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for instance management
pub type Result<T> = std::result::Result<T, InstanceManagementError>;

impl InstanceManagementError {
    pub fn malformed_id(id: impl Into<String>) -> Self {
        Self::MalformedId(id.into())
    }

    pub fn malformed_command(message: impl Into<String>) -> Self {
        Self::MalformedCommand(message.into())
    }

    /// Whether the caller may simply try again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Operation(e) if e.is_retryable())
    }
}
