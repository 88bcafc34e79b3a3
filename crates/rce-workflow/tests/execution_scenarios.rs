//! Multi-node workflow execution scenarios

use async_trait::async_trait;
use rce_notification::{
    CatchUpProcessor, ChannelBatchSink, NotificationConfig, NotificationRouter,
    NotificationService, SubscriptionManager,
};
use rce_types::{
    ExecutionId, NodeId, NotificationRecord, WorkflowDescription, WorkflowExecutionContext,
    WorkflowExecutionContextBuilder, WorkflowExecutionInformation, WorkflowNode, WorkflowState,
};
use rce_workflow::{
    next_state, ControllerRegistry, ControllerServiceResolver, InMemoryRunStore,
    LocalControllerService, NoopComponentsDriver, Result, StateNotification, StaticTopology,
    WorkflowEvent, WorkflowExecutionConfig, WorkflowExecutionControllerService,
    WorkflowExecutionError, WorkflowExecutionService, STATE_TOPIC_PREFIX,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn context_for(description: WorkflowDescription) -> WorkflowExecutionContext {
    WorkflowExecutionContextBuilder::new(description)
        .node_id_of_origin(NodeId::new("local"))
        .build()
        .unwrap()
}

/// Controller service counting how often it is asked to do anything
#[derive(Default)]
struct CountingService {
    calls: AtomicUsize,
}

impl CountingService {
    fn hit<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(WorkflowExecutionError::controller_unavailable(&ExecutionId::new("none")))
    }
}

#[async_trait]
impl WorkflowExecutionControllerService for CountingService {
    async fn create_execution_controller(
        &self,
        _context: WorkflowExecutionContext,
    ) -> Result<WorkflowExecutionInformation> {
        self.hit()
    }
    async fn start(&self, _id: &ExecutionId) -> Result<()> {
        self.hit()
    }
    async fn pause(&self, _id: &ExecutionId) -> Result<()> {
        self.hit()
    }
    async fn resume(&self, _id: &ExecutionId) -> Result<()> {
        self.hit()
    }
    async fn cancel(&self, _id: &ExecutionId) -> Result<()> {
        self.hit()
    }
    async fn dispose(&self, _id: &ExecutionId) -> Result<()> {
        self.hit()
    }
    async fn discard_execution_controller(&self, _id: &ExecutionId) -> Result<()> {
        self.hit()
    }
    async fn get_state(&self, _id: &ExecutionId) -> Result<WorkflowState> {
        self.hit()
    }
    async fn get_data_management_id(&self, _id: &ExecutionId) -> Result<u64> {
        self.hit()
    }
    async fn delete_from_data_management(&self, _id: &ExecutionId) -> Result<()> {
        self.hit()
    }
    async fn get_execution_informations(&self) -> Result<Vec<WorkflowExecutionInformation>> {
        self.hit()
    }
}

#[tokio::test]
async fn test_component_on_unavailable_node_is_never_started() {
    let local = NodeId::new("local");
    let topology = Arc::new(StaticTopology::new(local.clone()));
    topology.install_component(&local, "script", "1.0");

    let counting = Arc::new(CountingService::default());
    let registry = ControllerRegistry::new(local, counting.clone(), Duration::from_secs(1));
    let service = WorkflowExecutionService::new(
        topology,
        Arc::new(registry),
        WorkflowExecutionConfig::default(),
    );

    let description = WorkflowDescription::new("wf", 5)
        .with_node(WorkflowNode::new("Local Script", "script", "1.0"))
        .with_node(WorkflowNode::new("Remote Script", "script", "1.0").on_node(NodeId::new("X")));

    let report = service
        .validate_availability_of_nodes_and_components_from_local_knowledge(&description);
    assert!(!report.is_valid());
    assert!(report.missing_controller_node_id.is_none());
    assert_eq!(report.missing_components_node_ids.len(), 1);
    assert_eq!(
        report.missing_components_node_ids.get("Remote Script"),
        Some(&NodeId::new("X"))
    );

    let err = service
        .start_workflow_execution(context_for(description))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowExecutionError::Validation(_)));
    assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_only_listed_user_operations_are_legal() {
    use WorkflowState as S;
    let legal: &[(S, &str)] = &[
        (S::Init, "start"),
        (S::Running, "pause"),
        (S::Paused, "resume"),
        (S::Running, "cancel"),
        (S::Paused, "cancel"),
        (S::Finished, "dispose"),
        (S::Cancelled, "dispose"),
        (S::Failed, "dispose"),
        (S::ResultsRejected, "dispose"),
    ];
    let operations = [
        WorkflowEvent::StartRequested,
        WorkflowEvent::PauseRequested,
        WorkflowEvent::ResumeRequested,
        WorkflowEvent::CancelRequested,
        WorkflowEvent::DisposeRequested,
    ];

    for state in S::ALL {
        for operation in &operations {
            let expected = legal.contains(&(state, operation.operation()));
            for cancel_requested in [false, true] {
                assert_eq!(
                    next_state(state, operation, cancel_requested).is_some(),
                    expected,
                    "{} in {}",
                    operation.operation(),
                    state
                );
            }
        }
    }
}

struct Node {
    id: NodeId,
    notifications: Arc<NotificationService>,
    controllers: Arc<LocalControllerService>,
}

fn create_node(name: &str) -> Node {
    let id = NodeId::new(name);
    let notifications = NotificationService::new(
        id.clone(),
        NotificationConfig {
            batch_max_latency_ms: 5,
            ..Default::default()
        },
    );
    let controllers = LocalControllerService::new(
        id.clone(),
        WorkflowExecutionConfig::default(),
        Arc::new(NoopComponentsDriver::completing()),
        notifications.clone(),
        Arc::new(InMemoryRunStore::new()),
    );
    Node {
        id,
        notifications,
        controllers,
    }
}

#[tokio::test]
async fn test_remote_controller_run_observed_through_catch_up() {
    let local = create_node("local");
    let remote = create_node("remote");

    let topology = Arc::new(StaticTopology::new(local.id.clone()));
    topology.add_node(remote.id.clone(), true);
    topology.install_component(&remote.id, "script", "1.0");

    let registry = Arc::new(ControllerRegistry::new(
        local.id.clone(),
        local.controllers.clone(),
        Duration::from_secs(1),
    ));
    registry.connect(remote.id.clone(), remote.controllers.clone());
    let service = WorkflowExecutionService::new(
        topology.clone(),
        registry.clone(),
        WorkflowExecutionConfig::default(),
    );

    let description = WorkflowDescription::new("wf", 5)
        .with_controller_node(remote.id.clone())
        .with_node(WorkflowNode::new("A", "script", "1.0").on_node(remote.id.clone()));
    let info = service
        .start_workflow_execution(context_for(description))
        .await
        .unwrap();
    assert_eq!(info.handle.node_id(), &remote.id);

    let controller = remote.controllers.controller(info.handle.execution_id()).unwrap();
    assert!(
        controller
            .state_machine()
            .wait_for_state(WorkflowState::Finished, Duration::from_secs(2))
            .await
    );
    assert_eq!(
        service.get_workflow_state(&info.handle).await.unwrap(),
        WorkflowState::Finished
    );
    assert!(registry.resolve(&remote.id).is_ok());

    // a late observer gets the full state history in order
    let router = Arc::new(NotificationRouter::new(Duration::from_secs(1)));
    router.register(local.notifications.clone());
    router.register(remote.notifications.clone());
    let (sink, mut rx) = ChannelBatchSink::<NotificationRecord>::new();
    let processor = CatchUpProcessor::new(
        "observer",
        &NotificationConfig {
            batch_max_latency_ms: 5,
            ..Default::default()
        },
        sink,
    );
    let manager = SubscriptionManager::new(router, topology, processor);
    let report = manager.update_subscriptions(&[STATE_TOPIC_PREFIX]).await;
    assert!(report.is_complete());

    let mut states = Vec::new();
    while states.len() < 4 {
        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("closed");
        states.extend(batch.iter().filter_map(|r| match StateNotification::from_body(&r.body) {
            Some(StateNotification::NewState { state }) => Some(state),
            _ => None,
        }));
    }
    assert_eq!(
        states,
        vec![
            WorkflowState::Starting,
            WorkflowState::Preparing,
            WorkflowState::Running,
            WorkflowState::Finished
        ]
    );

    service.dispose(&info.handle).await.unwrap();
    assert!(
        controller
            .state_machine()
            .wait_for_state(WorkflowState::Disposed, Duration::from_secs(2))
            .await
    );
    service.delete_from_data_management(&info.handle).await.unwrap();
    let err = service.get_workflow_state(&info.handle).await.unwrap_err();
    assert!(matches!(err, WorkflowExecutionError::ControllerUnavailable(_)));
}
