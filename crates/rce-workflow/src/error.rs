//! Error types for workflow execution

use crate::validation::ValidationReport;
use rce_types::{ContextBuildError, ExecutionId, NodeId, WorkflowState};
use thiserror::Error;

/// Workflow execution error type
#[derive(Debug, Error)]
pub enum WorkflowExecutionError {
    /// The hosting node does not (or no longer) track this execution
    #[error("Workflow controller for {0} is not available")]
    ControllerUnavailable(ExecutionId),

    /// Requested operation is not legal in the current state
    #[error("Cannot {operation} {execution_id}: workflow is {current}")]
    InvalidState {
        execution_id: ExecutionId,
        current: WorkflowState,
        operation: &'static str,
    },

    /// The node that should handle the call is not reachable
    #[error("Remote node {0} is not reachable")]
    RemoteUnavailable(NodeId),

    /// A remote call exceeded its budget
    #[error("Call '{operation}' to {node} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        node: NodeId,
        timeout_ms: u64,
    },

    /// Nodes or components referenced by the workflow are unavailable
    #[error("Workflow cannot be started: {0}")]
    Validation(ValidationReport),

    /// A component has no installation on the node it should run on
    #[error("Component '{component}' is not installed on {node}")]
    ComponentNotInstalled { component: String, node: NodeId },

    /// An active execution with the same instance name exists
    #[error("A workflow execution named '{0}' is already active")]
    DuplicateExecution(String),

    /// Building the execution context failed
    #[error("Invalid execution context: {0}")]
    Context(#[from] ContextBuildError),

    /// Run data store failure
    #[error("Data management error: {0}")]
    DataManagement(String),
}

/// Result type for workflow execution operations
pub type Result<T> = std::result::Result<T, WorkflowExecutionError>;

impl WorkflowExecutionError {
    pub fn controller_unavailable(execution_id: &ExecutionId) -> Self {
        Self::ControllerUnavailable(execution_id.clone())
    }

    pub fn invalid_state(
        execution_id: &ExecutionId,
        current: WorkflowState,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            execution_id: execution_id.clone(),
            current,
            operation,
        }
    }

    pub fn timeout(operation: &'static str, node: &NodeId, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            node: node.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Whether the failure is about reaching a node rather than the execution itself
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_) | Self::Timeout { .. })
    }
}

/// Error reported by a components driver for a single attempt
#[derive(Debug, Clone, Error)]
#[error("{phase} attempt failed: {reason}")]
pub struct DriverError {
    pub phase: &'static str,
    pub reason: String,
}

impl DriverError {
    pub fn new(phase: &'static str, reason: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.into(),
        }
    }
}
