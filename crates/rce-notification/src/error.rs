//! Error types for notification delivery

use rce_types::NodeId;
use thiserror::Error;

/// Notification subsystem error type
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Topic pattern is not a valid regular expression
    #[error("Invalid topic pattern '{pattern}': {source}")]
    InvalidTopicPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// No publisher service is known for the node
    #[error("Notification service of {0} is not reachable")]
    PublisherUnavailable(NodeId),

    /// Remote call did not complete within its budget
    #[error("Notification call '{operation}' to {node} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        node: NodeId,
        timeout_ms: u64,
    },

    /// Remote call failed on the far side
    #[error("Remote notification call to {node} failed: {message}")]
    Remote { node: NodeId, message: String },

    /// A subscriber refused a batch
    #[error("Subscriber '{subscriber}' rejected notifications: {reason}")]
    SubscriberRejected { subscriber: String, reason: String },

    /// Delivery pipeline has shut down
    #[error("Notification channel closed")]
    ChannelClosed,
}

/// Result type for notification operations
pub type Result<T> = std::result::Result<T, NotificationError>;

impl NotificationError {
    /// Create a timeout error for a call against a node
    pub fn timeout(operation: &'static str, node: &NodeId, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            node: node.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Whether the failure says something about reachability rather than content
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::PublisherUnavailable(_) | Self::Timeout { .. } | Self::Remote { .. }
        )
    }
}
