//! Workflow execution service: the entry point for starting and steering runs
//!
//! Operations are addressed by [`WorkflowExecutionHandle`]; the handle's node
//! decides whether the call is served locally or forwarded to another node.

use crate::config::WorkflowExecutionConfig;
use crate::error::{Result, WorkflowExecutionError};
use crate::resolver::ControllerServiceResolver;
use crate::topology::TopologyView;
use crate::validation::ValidationReport;
use futures::future::join_all;
use rce_types::{
    NodeId, WorkflowDescription, WorkflowExecutionContext, WorkflowExecutionContextBuilder,
    WorkflowExecutionHandle, WorkflowExecutionInformation, WorkflowState,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

/// Starts, steers and lists workflow executions across the network
pub struct WorkflowExecutionService {
    topology: Arc<dyn TopologyView>,
    controllers: Arc<dyn ControllerServiceResolver>,
    config: WorkflowExecutionConfig,
    informations: RwLock<Option<Vec<WorkflowExecutionInformation>>>,
}

impl WorkflowExecutionService {
    pub fn new(
        topology: Arc<dyn TopologyView>,
        controllers: Arc<dyn ControllerServiceResolver>,
        config: WorkflowExecutionConfig,
    ) -> Self {
        Self {
            topology,
            controllers,
            config,
            informations: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &WorkflowExecutionConfig {
        &self.config
    }

    fn local_node(&self) -> &NodeId {
        self.topology.local_node()
    }

    /// Check controller and component placement against the cached topology.
    ///
    /// All problems are collected; nothing is contacted.
    pub fn validate_availability_of_nodes_and_components_from_local_knowledge(
        &self,
        description: &WorkflowDescription,
    ) -> ValidationReport {
        let local = self.local_node();
        let mut report = ValidationReport::default();

        let controller_node = description.controller_node.as_ref().unwrap_or(local);
        if controller_node != local
            && !(self.topology.is_reachable(controller_node)
                && self.topology.is_workflow_host(controller_node))
        {
            report.missing_controller_node_id = Some(controller_node.clone());
        }

        for node in &description.nodes {
            let target = node.execution_node.as_ref().unwrap_or(local);
            let available = self.topology.is_reachable(target)
                && self
                    .topology
                    .has_component(target, &node.component_id, &node.component_version);
            if !available {
                report
                    .missing_components_node_ids
                    .insert(node.name.clone(), target.clone());
            }
        }

        report
    }

    /// Fill in the local node wherever the workflow leaves placement open.
    ///
    /// Filled-in values are marked transient so they are not written back.
    fn substitute_local_placeholders(
        &self,
        description: &WorkflowDescription,
    ) -> Result<WorkflowDescription> {
        let local = self.local_node().clone();
        let mut resolved = description.clone();

        if resolved.controller_node.is_none() {
            resolved.controller_node = Some(local.clone());
            resolved.controller_node_transient = true;
        }

        for node in &mut resolved.nodes {
            if node.execution_node.is_some() {
                continue;
            }
            if !self
                .topology
                .has_component(&local, &node.component_id, &node.component_version)
            {
                return Err(WorkflowExecutionError::ComponentNotInstalled {
                    component: node.name.clone(),
                    node: local,
                });
            }
            node.execution_node = Some(local.clone());
            node.execution_node_transient = true;
        }

        Ok(resolved)
    }

    /// Tokens for component nodes: a fresh one for each local node, empty for remote ones
    fn auth_tokens(&self, description: &WorkflowDescription) -> HashMap<String, String> {
        let local = self.local_node();
        description
            .nodes
            .iter()
            .map(|node| {
                let token = match &node.execution_node {
                    Some(n) if n != local => String::new(),
                    _ => uuid::Uuid::new_v4().to_string(),
                };
                (node.identifier.clone(), token)
            })
            .collect()
    }

    fn prepare_context(&self, context: &WorkflowExecutionContext) -> Result<WorkflowExecutionContext> {
        let description = self.substitute_local_placeholders(context.description())?;
        let tokens = self.auth_tokens(&description);

        let mut builder = WorkflowExecutionContextBuilder::new(description)
            .instance_name(context.instance_name())
            .node_id_of_origin(context.node_id_of_origin().clone());
        if let Some(info) = context.additional_information() {
            builder = builder.additional_information(info);
        }
        for (node, token) in tokens {
            builder = builder.auth_token(node, token);
        }
        Ok(builder.build()?)
    }

    /// Validate, create the controller on its node and start it
    #[instrument(skip(self, context), fields(instance = %context.instance_name()))]
    pub async fn start_workflow_execution(
        &self,
        context: WorkflowExecutionContext,
    ) -> Result<WorkflowExecutionInformation> {
        let report =
            self.validate_availability_of_nodes_and_components_from_local_knowledge(context.description());
        if !report.is_valid() {
            warn!(report = %report, "Workflow start rejected");
            return Err(WorkflowExecutionError::Validation(report));
        }

        let context = self.prepare_context(&context)?;
        let controller_node = context
            .controller_node()
            .cloned()
            .unwrap_or_else(|| self.local_node().clone());

        let service = self.controllers.resolve(&controller_node)?;
        let information = service.create_execution_controller(context).await?;
        let execution_id = information.handle.execution_id();
        if let Err(e) = service.start(execution_id).await {
            if let Err(cleanup) = service.discard_execution_controller(execution_id).await {
                warn!(execution_id = %execution_id, error = %cleanup, "Failed to discard controller after failed start");
            }
            return Err(e);
        }

        self.informations.write().await.take();
        info!(handle = %information.handle, "Workflow execution started");
        Ok(WorkflowExecutionInformation {
            state: WorkflowState::Starting,
            ..information
        })
    }

    pub async fn cancel(&self, handle: &WorkflowExecutionHandle) -> Result<()> {
        self.controllers
            .resolve(handle.node_id())?
            .cancel(handle.execution_id())
            .await
    }

    pub async fn pause(&self, handle: &WorkflowExecutionHandle) -> Result<()> {
        self.controllers
            .resolve(handle.node_id())?
            .pause(handle.execution_id())
            .await
    }

    pub async fn resume(&self, handle: &WorkflowExecutionHandle) -> Result<()> {
        self.controllers
            .resolve(handle.node_id())?
            .resume(handle.execution_id())
            .await
    }

    pub async fn dispose(&self, handle: &WorkflowExecutionHandle) -> Result<()> {
        self.controllers
            .resolve(handle.node_id())?
            .dispose(handle.execution_id())
            .await
    }

    /// Last known state; may lag behind the controller
    pub async fn get_workflow_state(&self, handle: &WorkflowExecutionHandle) -> Result<WorkflowState> {
        self.controllers
            .resolve(handle.node_id())?
            .get_state(handle.execution_id())
            .await
    }

    pub async fn get_workflow_data_management_id(
        &self,
        handle: &WorkflowExecutionHandle,
    ) -> Result<u64> {
        self.controllers
            .resolve(handle.node_id())?
            .get_data_management_id(handle.execution_id())
            .await
    }

    pub async fn delete_from_data_management(&self, handle: &WorkflowExecutionHandle) -> Result<()> {
        self.controllers
            .resolve(handle.node_id())?
            .delete_from_data_management(handle.execution_id())
            .await?;
        self.informations.write().await.take();
        Ok(())
    }

    /// Executions on all workflow host nodes.
    ///
    /// Without `force_refresh` the result of the last query is reused. Nodes
    /// that fail to answer are logged and skipped.
    pub async fn get_workflow_execution_informations(
        &self,
        force_refresh: bool,
    ) -> Vec<WorkflowExecutionInformation> {
        if !force_refresh {
            if let Some(cached) = self.informations.read().await.as_ref() {
                return cached.clone();
            }
        }

        let mut nodes = self.topology.workflow_host_nodes();
        if !nodes.contains(self.local_node()) {
            nodes.push(self.local_node().clone());
        }

        let results = join_all(nodes.into_iter().map(|node| async move {
            let result = match self.controllers.resolve(&node) {
                Ok(service) => service.get_execution_informations().await,
                Err(e) => Err(e),
            };
            (node, result)
        }))
        .await;

        let mut informations = Vec::new();
        for (node, result) in results {
            match result {
                Ok(found) => informations.extend(found),
                Err(e) => warn!(node = %node, error = %e, "Failed to query workflow executions"),
            }
        }
        informations.sort_by(|a, b| a.start_time.cmp(&b.start_time));

        *self.informations.write().await = Some(informations.clone());
        informations
    }
}
