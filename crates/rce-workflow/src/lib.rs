//! RCE Workflow - distributed workflow execution
//!
//! A workflow run is owned by a controller on one node (the workflow host).
//! The controller drives a [`WorkflowStateMachine`] through the lifecycle
//! and publishes every state change on the run's state topic.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │   WorkflowExecutionService   │  validate, place, start, steer, list
//! └──────────────┬───────────────┘
//!                │ ControllerServiceResolver
//!      ┌─────────┴──────────┐
//!      ▼                    ▼
//! LocalControllerService   RemoteControllerProxy (timeout per call)
//!      │
//!      ▼
//! WorkflowExecutionController ─► WorkflowStateMachine ─► ComponentsDriver
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod file;
pub mod resolver;
pub mod service;
pub mod state_machine;
pub mod store;
pub mod topology;
pub mod tracker;
pub mod validation;

pub use config::WorkflowExecutionConfig;
pub use controller::{
    LocalControllerService, WorkflowExecutionController, WorkflowExecutionControllerService,
};
pub use driver::{ComponentsDriver, DriverContext, NoopComponentsDriver};
pub use error::{DriverError, Result, WorkflowExecutionError};
pub use file::{LoadedWorkflow, UpdatePolicy, WorkflowFileError, WorkflowFileLoader};
pub use resolver::{ControllerRegistry, ControllerServiceResolver, RemoteControllerProxy};
pub use service::WorkflowExecutionService;
pub use state_machine::{
    next_state, state_topic, StateNotification, WorkflowEvent, WorkflowEventSender,
    WorkflowStateMachine, STATE_TOPIC_PREFIX,
};
pub use store::{InMemoryRunStore, RunDataStore, RunRecord};
pub use topology::{StaticTopology, TopologyView};
pub use tracker::WorkflowStateTracker;
pub use validation::ValidationReport;
