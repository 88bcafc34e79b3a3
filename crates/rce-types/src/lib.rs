//! RCE Types - Core types shared by the RCE node services
//!
//! RCE executes scientific workflows whose components may live on different
//! network nodes. This crate holds the vocabulary every other crate speaks.
//!
//! ## Key Concepts
//!
//! - **NodeId**: identity of a node in the RCE network
//! - **WorkflowExecutionHandle**: (execution id, hosting node) lookup key for a run
//! - **WorkflowState**: lifecycle state of a single workflow run
//! - **WorkflowExecutionContext**: immutable start request, built once via a builder
//! - **NotificationRecord**: a sequenced event published on a topic by a node

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod ids;
pub mod notification;
pub mod state;
pub mod workflow;

// Re-export main types
pub use ids::{ExecutionId, NodeId, TopicId};
pub use notification::{CatchUpKey, CurrentNumbers, NotificationRecord};
pub use state::{UnknownStateError, WorkflowState};
pub use workflow::{
    ContextBuildError, WorkflowDescription, WorkflowExecutionContext,
    WorkflowExecutionContextBuilder, WorkflowExecutionHandle, WorkflowExecutionInformation,
    WorkflowNode,
};
