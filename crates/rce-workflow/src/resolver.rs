//! Finding the controller service responsible for a node

use crate::controller::WorkflowExecutionControllerService;
use crate::error::{Result, WorkflowExecutionError};
use async_trait::async_trait;
use dashmap::DashMap;
use rce_types::{ExecutionId, NodeId, WorkflowExecutionContext, WorkflowExecutionInformation, WorkflowState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Maps a node to the controller service running there
pub trait ControllerServiceResolver: Send + Sync {
    fn resolve(&self, node: &NodeId) -> Result<Arc<dyn WorkflowExecutionControllerService>>;
}

/// Local service plus proxies for the controller services of other nodes
pub struct ControllerRegistry {
    local_node: NodeId,
    local: Arc<dyn WorkflowExecutionControllerService>,
    remotes: DashMap<NodeId, Arc<dyn WorkflowExecutionControllerService>>,
    call_timeout: Duration,
}

impl ControllerRegistry {
    pub fn new(
        local_node: NodeId,
        local: Arc<dyn WorkflowExecutionControllerService>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            local_node,
            local,
            remotes: DashMap::new(),
            call_timeout,
        }
    }

    /// Make the controller service of another node reachable
    pub fn connect(&self, node: NodeId, service: Arc<dyn WorkflowExecutionControllerService>) {
        info!(node = %node, "Connected remote controller service");
        self.remotes.insert(node, service);
    }

    pub fn disconnect(&self, node: &NodeId) -> bool {
        self.remotes.remove(node).is_some()
    }
}

impl ControllerServiceResolver for ControllerRegistry {
    fn resolve(&self, node: &NodeId) -> Result<Arc<dyn WorkflowExecutionControllerService>> {
        if node == &self.local_node {
            return Ok(self.local.clone());
        }
        let inner = self
            .remotes
            .get(node)
            .map(|s| s.value().clone())
            .ok_or_else(|| WorkflowExecutionError::RemoteUnavailable(node.clone()))?;
        Ok(Arc::new(RemoteControllerProxy {
            node: node.clone(),
            inner,
            call_timeout: self.call_timeout,
        }))
    }
}

/// Forwards calls to another node's service with a time budget per call
pub struct RemoteControllerProxy {
    node: NodeId,
    inner: Arc<dyn WorkflowExecutionControllerService>,
    call_timeout: Duration,
}

impl RemoteControllerProxy {
    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| WorkflowExecutionError::timeout(operation, &self.node, self.call_timeout))?
    }
}

#[async_trait]
impl WorkflowExecutionControllerService for RemoteControllerProxy {
    async fn create_execution_controller(
        &self,
        context: WorkflowExecutionContext,
    ) -> Result<WorkflowExecutionInformation> {
        self.call("create", self.inner.create_execution_controller(context))
            .await
    }

    async fn start(&self, execution_id: &ExecutionId) -> Result<()> {
        self.call("start", self.inner.start(execution_id)).await
    }

    async fn pause(&self, execution_id: &ExecutionId) -> Result<()> {
        self.call("pause", self.inner.pause(execution_id)).await
    }

    async fn resume(&self, execution_id: &ExecutionId) -> Result<()> {
        self.call("resume", self.inner.resume(execution_id)).await
    }

    async fn cancel(&self, execution_id: &ExecutionId) -> Result<()> {
        self.call("cancel", self.inner.cancel(execution_id)).await
    }

    async fn dispose(&self, execution_id: &ExecutionId) -> Result<()> {
        self.call("dispose", self.inner.dispose(execution_id)).await
    }

    async fn discard_execution_controller(&self, execution_id: &ExecutionId) -> Result<()> {
        self.call("discard", self.inner.discard_execution_controller(execution_id))
            .await
    }

    async fn get_state(&self, execution_id: &ExecutionId) -> Result<WorkflowState> {
        self.call("get_state", self.inner.get_state(execution_id)).await
    }

    async fn get_data_management_id(&self, execution_id: &ExecutionId) -> Result<u64> {
        self.call(
            "get_data_management_id",
            self.inner.get_data_management_id(execution_id),
        )
        .await
    }

    async fn delete_from_data_management(&self, execution_id: &ExecutionId) -> Result<()> {
        self.call(
            "delete_from_data_management",
            self.inner.delete_from_data_management(execution_id),
        )
        .await
    }

    async fn get_execution_informations(&self) -> Result<Vec<WorkflowExecutionInformation>> {
        self.call(
            "get_execution_informations",
            self.inner.get_execution_informations(),
        )
        .await
    }
}
