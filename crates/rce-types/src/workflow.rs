//! Workflow descriptions, execution contexts and handles

use crate::{ExecutionId, NodeId, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// ── Workflow Description ─────────────────────────────────────────────

/// A component placed in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    /// Unique identifier of the node within the workflow
    pub identifier: String,
    /// Display name, also used as key in validation reports
    pub name: String,
    /// Component identifier (e.g. `de.rcenvironment.script`)
    pub component_id: String,
    /// Component version
    pub component_version: String,
    /// Node that should execute the component; `None` means "local"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_node: Option<NodeId>,
    /// Set when `execution_node` was filled in at start time and must not be persisted
    #[serde(skip)]
    pub execution_node_transient: bool,
}

impl WorkflowNode {
    pub fn new(
        name: impl Into<String>,
        component_id: impl Into<String>,
        component_version: impl Into<String>,
    ) -> Self {
        Self {
            identifier: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            component_id: component_id.into(),
            component_version: component_version.into(),
            execution_node: None,
            execution_node_transient: false,
        }
    }

    pub fn on_node(mut self, node: NodeId) -> Self {
        self.execution_node = Some(node);
        self
    }
}

/// Workflow as loaded from a `.wf` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDescription {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    /// File format version
    #[serde(default)]
    pub workflow_version: u32,
    /// Node that should host the controller; `None` means "local"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_node: Option<NodeId>,
    #[serde(skip)]
    pub controller_node_transient: bool,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_information: Option<String>,
}

impl WorkflowDescription {
    pub fn new(name: impl Into<String>, workflow_version: u32) -> Self {
        Self {
            identifier: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            workflow_version,
            controller_node: None,
            controller_node_transient: false,
            nodes: Vec::new(),
            additional_information: None,
        }
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_controller_node(mut self, node: NodeId) -> Self {
        self.controller_node = Some(node);
        self
    }

    /// Copy suitable for writing back to disk: values that were filled in
    /// at start time are removed again.
    pub fn to_persistent(&self) -> Self {
        let mut copy = self.clone();
        if copy.controller_node_transient {
            copy.controller_node = None;
            copy.controller_node_transient = false;
        }
        for node in &mut copy.nodes {
            if node.execution_node_transient {
                node.execution_node = None;
                node.execution_node_transient = false;
            }
        }
        copy
    }
}

// ── Execution Handle ─────────────────────────────────────────────────

/// Lookup key for a workflow execution: which run, hosted where
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecutionHandle {
    execution_id: ExecutionId,
    node_id: NodeId,
}

impl WorkflowExecutionHandle {
    pub fn new(execution_id: ExecutionId, node_id: NodeId) -> Self {
        Self {
            execution_id,
            node_id,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Node hosting the workflow controller
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

impl std::fmt::Display for WorkflowExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.execution_id, self.node_id)
    }
}

// ── Execution Context ────────────────────────────────────────────────

/// Everything needed to start a workflow execution. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionContext {
    description: WorkflowDescription,
    instance_name: String,
    node_id_of_origin: NodeId,
    controller_node: Option<NodeId>,
    auth_tokens: HashMap<String, String>,
    additional_information: Option<String>,
}

impl WorkflowExecutionContext {
    pub fn description(&self) -> &WorkflowDescription {
        &self.description
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Node the start request came from
    pub fn node_id_of_origin(&self) -> &NodeId {
        &self.node_id_of_origin
    }

    /// Requested controller node; `None` means the local node
    pub fn controller_node(&self) -> Option<&NodeId> {
        self.controller_node.as_ref()
    }

    /// Component auth tokens, keyed by workflow node identifier
    pub fn auth_tokens(&self) -> &HashMap<String, String> {
        &self.auth_tokens
    }

    pub fn additional_information(&self) -> Option<&str> {
        self.additional_information.as_deref()
    }

    /// Derive a context with auth tokens filled in; everything else is kept
    pub fn with_auth_tokens(&self, auth_tokens: HashMap<String, String>) -> Self {
        Self {
            auth_tokens,
            ..self.clone()
        }
    }
}

/// Errors raised while building an execution context
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextBuildError {
    #[error("Node of origin is not set")]
    MissingOrigin,

    #[error("Workflow '{0}' has no nodes")]
    EmptyWorkflow(String),
}

/// Builder for [`WorkflowExecutionContext`]
#[derive(Debug, Clone)]
pub struct WorkflowExecutionContextBuilder {
    description: WorkflowDescription,
    instance_name: Option<String>,
    node_id_of_origin: Option<NodeId>,
    auth_tokens: HashMap<String, String>,
    additional_information: Option<String>,
    allow_empty: bool,
}

impl WorkflowExecutionContextBuilder {
    pub fn new(description: WorkflowDescription) -> Self {
        Self {
            description,
            instance_name: None,
            node_id_of_origin: None,
            auth_tokens: HashMap::new(),
            additional_information: None,
            allow_empty: true,
        }
    }

    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    pub fn node_id_of_origin(mut self, node: NodeId) -> Self {
        self.node_id_of_origin = Some(node);
        self
    }

    pub fn auth_token(mut self, node_identifier: impl Into<String>, token: impl Into<String>) -> Self {
        self.auth_tokens.insert(node_identifier.into(), token.into());
        self
    }

    pub fn additional_information(mut self, info: impl Into<String>) -> Self {
        self.additional_information = Some(info.into());
        self
    }

    /// Reject workflows without any component
    pub fn require_nodes(mut self) -> Self {
        self.allow_empty = false;
        self
    }

    pub fn build(self) -> Result<WorkflowExecutionContext, ContextBuildError> {
        let node_id_of_origin = self.node_id_of_origin.ok_or(ContextBuildError::MissingOrigin)?;
        if !self.allow_empty && self.description.nodes.is_empty() {
            return Err(ContextBuildError::EmptyWorkflow(self.description.name));
        }

        let instance_name = self.instance_name.unwrap_or_else(|| {
            format!(
                "{}_{}",
                self.description.name,
                Utc::now().format("%Y-%m-%d_%H:%M:%S")
            )
        });

        Ok(WorkflowExecutionContext {
            controller_node: self.description.controller_node.clone(),
            description: self.description,
            instance_name,
            node_id_of_origin,
            auth_tokens: self.auth_tokens,
            additional_information: self.additional_information,
        })
    }
}

// ── Execution Information ────────────────────────────────────────────

/// Snapshot describing a workflow execution, as reported by its controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionInformation {
    pub handle: WorkflowExecutionHandle,
    pub instance_name: String,
    pub workflow_name: String,
    pub node_id_starting: NodeId,
    pub state: WorkflowState,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_information: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_management_id: Option<u64>,
}
