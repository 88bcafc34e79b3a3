//! Node lifecycle: notification, controller and execution services of one node
//!
//! Besides hosting controllers, a node follows the state topics of every
//! workflow host it knows about. Those subscriptions go through one
//! [`SubscriptionManager`] whose catch-up processor feeds a
//! [`WorkflowStateTracker`].

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use rce_instance::profile::{is_shutdown_requested, write_shutdown_data, CONFIGURATION_FILE};
use rce_instance::{InstanceConfiguration, ProfileLock};
use rce_notification::{
    CatchUpProcessor, NotificationRouter, NotificationService, SubscriptionManager,
    SubscriptionReport,
};
use rce_types::{
    ExecutionId, NodeId, WorkflowExecutionContextBuilder, WorkflowExecutionInformation,
    WorkflowState,
};
use rce_workflow::{
    ControllerRegistry, InMemoryRunStore, LocalControllerService, NoopComponentsDriver,
    StaticTopology, UpdatePolicy, WorkflowExecutionService, WorkflowFileLoader,
    WorkflowStateTracker, STATE_TOPIC_PREFIX,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How often a running instance looks for a shutdown request in its profile
const SHUTDOWN_REQUEST_POLL: Duration = Duration::from_millis(200);

/// Printed on stdout once the profile is locked and the node is up
pub const STARTUP_MARKER: &str = "Early startup complete";

/// Running services of this node
pub struct Node {
    node_id: NodeId,
    notifications: Arc<NotificationService>,
    controllers: Arc<LocalControllerService>,
    workflows: WorkflowExecutionService,
    topology: Arc<StaticTopology>,
    router: Arc<NotificationRouter>,
    subscriptions: Arc<SubscriptionManager>,
    states: Arc<WorkflowStateTracker>,
    heartbeat: JoinHandle<()>,
    refresh: JoinHandle<()>,
}

impl Node {
    /// Wire up and start the services; must be called inside a Tokio runtime
    pub fn start(node_id: NodeId, config: &DaemonConfig) -> Self {
        let notifications =
            NotificationService::new(node_id.clone(), config.notifications.clone());
        let controllers = LocalControllerService::new(
            node_id.clone(),
            config.workflow.clone(),
            Arc::new(NoopComponentsDriver::completing()),
            notifications.clone(),
            Arc::new(InMemoryRunStore::new()),
        );
        let heartbeat = controllers.spawn_heartbeat();

        let topology = Arc::new(StaticTopology::new(node_id.clone()));
        topology.add_node(node_id.clone(), config.node.workflow_host);
        let registry = Arc::new(ControllerRegistry::new(
            node_id.clone(),
            controllers.clone(),
            config.workflow.remote_call_timeout(),
        ));
        let workflows =
            WorkflowExecutionService::new(topology.clone(), registry, config.workflow.clone());

        let router = Arc::new(NotificationRouter::new(
            config.notifications.remote_call_timeout(),
        ));
        router.register(notifications.clone());
        let states = WorkflowStateTracker::new();
        let processor = CatchUpProcessor::new(
            format!("{}/workflow-states", node_id),
            &config.notifications,
            states.clone(),
        );
        states.attach(&processor);
        let subscriptions = Arc::new(SubscriptionManager::new(
            router.clone(),
            topology.clone(),
            processor,
        ));
        let refresh =
            spawn_subscription_refresh(subscriptions.clone(), config.node.subscription_refresh());

        info!(node = %node_id, workflow_host = config.node.workflow_host, "Node started");
        Self {
            node_id,
            notifications,
            controllers,
            workflows,
            topology,
            router,
            subscriptions,
            states,
            heartbeat,
            refresh,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn notifications(&self) -> &Arc<NotificationService> {
        &self.notifications
    }

    pub fn workflows(&self) -> &WorkflowExecutionService {
        &self.workflows
    }

    pub fn active_controllers(&self) -> usize {
        self.controllers.controller_count()
    }

    /// Last state seen for an execution on any followed node
    pub fn workflow_state(&self, execution_id: &ExecutionId) -> Option<WorkflowState> {
        self.states.state(execution_id)
    }

    /// Make another node's publisher reachable and follow its workflow states
    pub async fn connect_node(
        &self,
        service: Arc<NotificationService>,
        workflow_host: bool,
    ) -> SubscriptionReport {
        let node = service.node_id().clone();
        self.router.register(service);
        self.topology.add_node(node.clone(), workflow_host);
        info!(node = %node, workflow_host, "Node connected");
        self.subscriptions
            .update_subscriptions(&[STATE_TOPIC_PREFIX])
            .await
    }

    /// Forget a node that left the network; returns whether it was connected
    pub fn disconnect_node(&self, node: &NodeId) -> bool {
        let known = self.router.deregister(node);
        self.topology.remove_node(node);
        self.subscriptions.forget_node(node);
        info!(node = %node, "Node disconnected");
        known
    }

    pub fn is_following(&self, node: &NodeId) -> bool {
        self.subscriptions.is_subscribed(node, STATE_TOPIC_PREFIX)
    }

    /// Load a workflow file, upgrading it in memory if needed, and start it here
    pub async fn start_workflow_file(&self, path: &Path) -> DaemonResult<WorkflowExecutionInformation> {
        let loaded = WorkflowFileLoader::new().load(path, UpdatePolicy::Silent)?;
        if loaded.updated {
            info!(path = %path.display(), from = loaded.original_version, "Workflow file was upgraded in memory");
        }
        let context = WorkflowExecutionContextBuilder::new(loaded.description)
            .node_id_of_origin(self.node_id.clone())
            .build()?;
        Ok(self.workflows.start_workflow_execution(context).await?)
    }

    pub fn shutdown(self) {
        self.refresh.abort();
        self.heartbeat.abort();
        info!(node = %self.node_id, "Node stopped");
    }
}

fn spawn_subscription_refresh(
    subscriptions: Arc<SubscriptionManager>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = subscriptions
                .update_subscriptions(&[STATE_TOPIC_PREFIX])
                .await;
            if !report.is_complete() {
                debug!(failed = report.failed.len(), "Some state subscriptions are still missing");
            }
        }
    })
}

/// Node id from configuration, the profile's instance name, or the host name
pub fn resolve_node_id(config: &DaemonConfig, profile: Option<&Path>) -> NodeId {
    if let Some(id) = &config.node.node_id {
        return NodeId::new(id.clone());
    }
    if let Some(profile) = profile {
        match InstanceConfiguration::load(&profile.join(CONFIGURATION_FILE)) {
            Ok(configuration) => {
                if let Some(name) = configuration
                    .get("general/instanceName")
                    .and_then(|v| v.as_str())
                {
                    return NodeId::new(name);
                }
            }
            Err(e) => warn!(error = %e, "Failed to read profile configuration"),
        }
    }
    NodeId::new(std::env::var("HOSTNAME").unwrap_or_else(|_| "local-node".to_string()))
}

/// Take the profile lock, or fail if another process runs on the profile.
///
/// On success the process id is recorded in the profile so that instance
/// management can stop this process from anywhere.
pub fn lock_profile(profile: &Path) -> DaemonResult<ProfileLock> {
    let lock = ProfileLock::try_acquire(profile)?
        .ok_or_else(|| DaemonError::ProfileLocked(profile.to_path_buf()))?;
    write_shutdown_data(profile, std::process::id())?;
    Ok(lock)
}

/// Resolves once instance management asked the instance on `profile` to stop
pub async fn shutdown_requested(profile: &Path) {
    let mut ticker = tokio::time::interval(SHUTDOWN_REQUEST_POLL);
    loop {
        ticker.tick().await;
        if is_shutdown_requested(profile) {
            info!(profile = %profile.display(), "Shutdown requested through the profile");
            return;
        }
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rce_notification::NotificationConfig;
    use rce_workflow::{state_topic, StateNotification};
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn wait_for_state(node: &Node, id: &ExecutionId, expected: WorkflowState) {
        timeout(Duration::from_secs(5), async {
            while node.workflow_state(id) != Some(expected) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_node_id_from_profile() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIGURATION_FILE),
            r#"{ "general": { "instanceName": "relay-7" } }"#,
        )
        .unwrap();
        let config = DaemonConfig::default();
        assert_eq!(resolve_node_id(&config, Some(dir.path())), NodeId::new("relay-7"));

        let mut config = DaemonConfig::default();
        config.node.node_id = Some("fixed".into());
        assert_eq!(resolve_node_id(&config, Some(dir.path())), NodeId::new("fixed"));
    }

    #[test]
    fn test_profile_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let held = lock_profile(dir.path()).unwrap();
        assert_eq!(
            rce_instance::profile::read_shutdown_pid(dir.path()).unwrap(),
            Some(std::process::id())
        );
        assert!(matches!(lock_profile(dir.path()), Err(DaemonError::ProfileLocked(_))));
        drop(held);
        assert!(lock_profile(dir.path()).is_ok());
    }

    #[tokio::test]
    async fn test_empty_workflow_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.wf");
        std::fs::write(
            &path,
            r#"{ "identifier": "wf-1", "name": "empty", "workflowVersion": 5, "nodes": [] }"#,
        )
        .unwrap();

        let node = Node::start(NodeId::new("node-a"), &DaemonConfig::default());
        let information = node.start_workflow_file(&path).await.unwrap();
        assert_eq!(information.workflow_name, "empty");
        assert_eq!(information.node_id_starting, NodeId::new("node-a"));
        assert_eq!(node.active_controllers(), 1);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_local_execution_states_are_followed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.wf");
        std::fs::write(
            &path,
            r#"{ "identifier": "wf-2", "name": "empty", "workflowVersion": 5, "nodes": [] }"#,
        )
        .unwrap();

        let node = Node::start(NodeId::new("node-a"), &DaemonConfig::default());
        let information = node.start_workflow_file(&path).await.unwrap();
        let id = information.handle.execution_id().clone();
        wait_for_state(&node, &id, WorkflowState::Finished).await;
        assert!(node.is_following(&NodeId::new("node-a")));
        node.shutdown();
    }

    #[tokio::test]
    async fn test_connected_node_history_is_caught_up() {
        let node = Node::start(NodeId::new("node-a"), &DaemonConfig::default());
        let remote = NotificationService::new(NodeId::new("node-b"), NotificationConfig::default());
        let id = ExecutionId::new("remote-run");
        remote.send(
            state_topic(&id),
            StateNotification::NewState { state: WorkflowState::Starting }.to_body(),
        );
        remote.send(
            state_topic(&id),
            StateNotification::NewState { state: WorkflowState::Running }.to_body(),
        );

        let report = node.connect_node(remote.clone(), true).await;
        assert!(report.is_complete());
        assert!(node.is_following(&NodeId::new("node-b")));
        wait_for_state(&node, &id, WorkflowState::Running).await;

        remote.send(
            state_topic(&id),
            StateNotification::NewState { state: WorkflowState::Finished }.to_body(),
        );
        wait_for_state(&node, &id, WorkflowState::Finished).await;

        assert!(node.disconnect_node(&NodeId::new("node-b")));
        assert!(!node.is_following(&NodeId::new("node-b")));
        assert!(!node.disconnect_node(&NodeId::new("node-b")));
        node.shutdown();
    }
}
