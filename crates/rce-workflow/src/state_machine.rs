//! Workflow state machine: lifecycle of a single workflow run
//!
//! Every change of state is the result of an event. User requests (start,
//! pause, resume, cancel, dispose) are events too; they are applied
//! synchronously and rejected when illegal in the current state. Accepted
//! transitions may trigger a driver action, which runs in the background and
//! reports its outcome as another event through the machine's event loop.
//!
//! ```text
//! INIT ─► STARTING ─► PREPARING ─► RUNNING ─► FINISHED ─► DISPOSING ─► DISPOSED
//!                                   │  ▲
//!                                   ▼  │
//!                        PAUSING ─► PAUSED ─► RESUMING
//! ```

use crate::driver::{ComponentsDriver, DriverContext};
use crate::error::{DriverError, Result, WorkflowExecutionError};
use crate::store::RunDataStore;
use rce_notification::NotificationService;
use rce_types::{ExecutionId, TopicId, WorkflowExecutionContext, WorkflowState};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Prefix of the per-execution state notification topic
pub const STATE_TOPIC_PREFIX: &str = "rce.component.workflow.state:";

/// Topic carrying state changes and heartbeats of one execution
pub fn state_topic(execution_id: &ExecutionId) -> TopicId {
    TopicId::new(format!("{}{}", STATE_TOPIC_PREFIX, execution_id.as_str()))
}

/// Body of notifications on a state topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateNotification {
    NewState { state: WorkflowState },
    IsAlive,
}

impl StateNotification {
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    pub fn from_body(body: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(body.clone()).ok()
    }
}

// ── Events ───────────────────────────────────────────────────────────

/// Input of the state machine
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    StartRequested,
    StartAttemptSuccessful,
    PrepareAttemptSuccessful,
    PauseRequested,
    PauseAttemptSuccessful,
    ResumeRequested,
    ResumeAttemptSuccessful,
    CancelRequested,
    CancelAttemptSuccessful,
    CancelAttemptFailed(String),
    DisposeRequested,
    DisposeAttemptSuccessful,
    DisposeAttemptFailed(String),
    ComponentsFinished,
    ResultsRejected(String),
    AttemptFailed(DriverError),
    ComponentHeartbeatLost(String),
}

impl WorkflowEvent {
    /// Name used in error messages
    pub fn operation(&self) -> &'static str {
        match self {
            Self::StartRequested => "start",
            Self::PauseRequested => "pause",
            Self::ResumeRequested => "resume",
            Self::CancelRequested => "cancel",
            Self::DisposeRequested => "dispose",
            Self::StartAttemptSuccessful => "complete start of",
            Self::PrepareAttemptSuccessful => "complete preparation of",
            Self::PauseAttemptSuccessful => "complete pause of",
            Self::ResumeAttemptSuccessful => "complete resume of",
            Self::CancelAttemptSuccessful => "complete cancel of",
            Self::CancelAttemptFailed(_) => "fail cancel of",
            Self::DisposeAttemptSuccessful | Self::DisposeAttemptFailed(_) => "complete dispose of",
            Self::ComponentsFinished => "finish",
            Self::ResultsRejected(_) => "reject results of",
            Self::AttemptFailed(_) => "fail",
            Self::ComponentHeartbeatLost(_) => "handle lost component of",
        }
    }

    fn failure_reason(&self) -> Option<String> {
        match self {
            Self::AttemptFailed(e) => Some(e.to_string()),
            Self::ComponentHeartbeatLost(c) => Some(format!("heartbeat of component '{}' lost", c)),
            Self::ResultsRejected(r) => Some(format!("results rejected: {}", r)),
            Self::CancelAttemptFailed(r) => Some(format!("cancel failed: {}", r)),
            Self::DisposeAttemptFailed(r) => Some(format!("dispose failed: {}", r)),
            _ => None,
        }
    }
}

/// Posts events into a state machine's event loop
#[derive(Clone)]
pub struct WorkflowEventSender(mpsc::UnboundedSender<WorkflowEvent>);

impl WorkflowEventSender {
    pub fn post(&self, event: WorkflowEvent) {
        if self.0.send(event).is_err() {
            debug!("State machine gone, event dropped");
        }
    }
}

// ── Transition table ─────────────────────────────────────────────────

/// Successor state for `event` in `current`, `None` if the event is illegal.
///
/// `cancel_requested` tells whether a user asked for cancellation before
/// the run failed or its results were rejected.
pub fn next_state(
    current: WorkflowState,
    event: &WorkflowEvent,
    cancel_requested: bool,
) -> Option<WorkflowState> {
    use WorkflowEvent as E;
    use WorkflowState as S;

    let next = match (current, event) {
        (S::Init, E::StartRequested) => S::Starting,
        (S::Starting, E::StartAttemptSuccessful) => S::Preparing,
        (S::Preparing, E::PrepareAttemptSuccessful) => S::Running,

        (S::Preparing | S::Running | S::Pausing, E::ComponentsFinished) => S::Finished,

        (S::Running, E::PauseRequested) => S::Pausing,
        (S::Pausing, E::PauseAttemptSuccessful) => S::Paused,
        (S::Paused, E::ResumeRequested) => S::Resuming,
        (S::Resuming, E::ResumeAttemptSuccessful) => S::Running,

        (S::Running | S::Paused, E::CancelRequested) => S::Canceling,
        (S::Canceling, E::CancelAttemptSuccessful) => S::Cancelled,
        (S::CancelingAfterFailed, E::CancelAttemptSuccessful) if cancel_requested => S::Cancelled,
        (S::CancelingAfterFailed, E::CancelAttemptSuccessful) => S::Failed,
        (S::CancelingAfterResultsRejected, E::CancelAttemptSuccessful) if cancel_requested => {
            S::Cancelled
        }
        (S::CancelingAfterResultsRejected, E::CancelAttemptSuccessful) => S::ResultsRejected,
        (
            S::Canceling | S::CancelingAfterFailed | S::CancelingAfterResultsRejected,
            E::CancelAttemptFailed(_),
        ) => S::Failed,

        (
            S::Starting | S::Preparing | S::Running | S::Pausing | S::Resuming | S::Canceling,
            E::AttemptFailed(_) | E::ComponentHeartbeatLost(_),
        ) => S::CancelingAfterFailed,
        (S::Running, E::ResultsRejected(_)) => S::CancelingAfterResultsRejected,

        (s, E::DisposeRequested) if s.is_disposable() => S::Disposing,
        (S::Disposing, E::DisposeAttemptSuccessful | E::DisposeAttemptFailed(_)) => S::Disposed,

        _ => return None,
    };
    Some(next)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverAction {
    Initialize,
    Prepare,
    Start,
    Pause,
    Resume,
    Cancel,
    Dispose,
}

fn action_for(from: WorkflowState, to: WorkflowState) -> Option<DriverAction> {
    use WorkflowState as S;
    match (from, to) {
        (_, S::Starting) => Some(DriverAction::Initialize),
        (_, S::Preparing) => Some(DriverAction::Prepare),
        (S::Preparing, S::Running) => Some(DriverAction::Start),
        (_, S::Pausing) => Some(DriverAction::Pause),
        (_, S::Resuming) => Some(DriverAction::Resume),
        (_, S::Canceling | S::CancelingAfterFailed | S::CancelingAfterResultsRejected) => {
            Some(DriverAction::Cancel)
        }
        (_, S::Disposing) => Some(DriverAction::Dispose),
        _ => None,
    }
}

// ── State machine ────────────────────────────────────────────────────

struct MachineState {
    state: WorkflowState,
    cancel_requested: bool,
    failure: Option<String>,
}

/// Owns the state of one workflow run
pub struct WorkflowStateMachine {
    execution_id: ExecutionId,
    run_id: u64,
    inner: Mutex<MachineState>,
    state_tx: watch::Sender<WorkflowState>,
    events: WorkflowEventSender,
    driver: Arc<dyn ComponentsDriver>,
    driver_context: DriverContext,
    notifications: Arc<NotificationService>,
    store: Arc<dyn RunDataStore>,
}

impl WorkflowStateMachine {
    /// Create the machine in INIT and start its event loop
    pub fn new(
        execution_id: ExecutionId,
        context: Arc<WorkflowExecutionContext>,
        run_id: u64,
        driver: Arc<dyn ComponentsDriver>,
        notifications: Arc<NotificationService>,
        store: Arc<dyn RunDataStore>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkflowEvent>();
        let events = WorkflowEventSender(tx);
        let (state_tx, _) = watch::channel(WorkflowState::Init);

        let machine = Arc::new(Self {
            driver_context: DriverContext::new(execution_id.clone(), context, events.clone()),
            execution_id,
            run_id,
            inner: Mutex::new(MachineState {
                state: WorkflowState::Init,
                cancel_requested: false,
                failure: None,
            }),
            state_tx,
            events,
            driver,
            notifications,
            store,
        });

        let weak = Arc::downgrade(&machine);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(machine) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = machine.handle_event(event) {
                    // outcome of an attempt that was overtaken by another transition
                    debug!(error = %e, "Ignoring stale event");
                }
            }
        });

        machine
    }

    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn state(&self) -> WorkflowState {
        self.lock().state
    }

    /// Reason of the failure that ended or is ending the run
    pub fn failure(&self) -> Option<String> {
        self.lock().failure.clone()
    }

    pub fn event_sender(&self) -> WorkflowEventSender {
        self.events.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkflowState> {
        self.state_tx.subscribe()
    }

    /// Wait until the machine reaches `target`; false on timeout
    pub async fn wait_for_state(&self, target: WorkflowState, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn start(&self) -> Result<WorkflowState> {
        self.handle_event(WorkflowEvent::StartRequested)
    }

    pub fn pause(&self) -> Result<WorkflowState> {
        self.handle_event(WorkflowEvent::PauseRequested)
    }

    pub fn resume(&self) -> Result<WorkflowState> {
        self.handle_event(WorkflowEvent::ResumeRequested)
    }

    pub fn cancel(&self) -> Result<WorkflowState> {
        self.handle_event(WorkflowEvent::CancelRequested)
    }

    pub fn dispose(&self) -> Result<WorkflowState> {
        self.handle_event(WorkflowEvent::DisposeRequested)
    }

    /// Apply one event; illegal events leave the state untouched
    pub fn handle_event(&self, event: WorkflowEvent) -> Result<WorkflowState> {
        let mut inner = self.lock();
        let current = inner.state;

        let Some(next) = next_state(current, &event, inner.cancel_requested) else {
            return Err(WorkflowExecutionError::invalid_state(
                &self.execution_id,
                current,
                event.operation(),
            ));
        };

        if matches!(event, WorkflowEvent::CancelRequested) {
            inner.cancel_requested = true;
        }
        if let Some(reason) = event.failure_reason() {
            warn!(execution_id = %self.execution_id, state = %current, reason = %reason, "Workflow failure");
            inner.failure.get_or_insert(reason);
        }

        inner.state = next;
        self.state_tx.send_replace(next);
        info!(execution_id = %self.execution_id, from = %current, to = %next, "Workflow state changed");

        // published under the lock so subscribers see transitions in order
        self.notifications.send(
            state_topic(&self.execution_id),
            StateNotification::NewState { state: next }.to_body(),
        );

        if next.is_final() {
            if let Err(e) = self.store.finish_run(self.run_id, next) {
                warn!(execution_id = %self.execution_id, error = %e, "Failed to record end of run");
            }
        }

        if let Some(action) = action_for(current, next) {
            self.spawn_action(action);
        }

        Ok(next)
    }

    fn spawn_action(&self, action: DriverAction) {
        let driver = self.driver.clone();
        let run = self.driver_context.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            debug!(execution_id = %run.execution_id(), ?action, "Running driver action");
            let event = match action {
                DriverAction::Initialize => match driver.initialize(&run).await {
                    Ok(()) => WorkflowEvent::StartAttemptSuccessful,
                    Err(e) => WorkflowEvent::AttemptFailed(e),
                },
                DriverAction::Prepare => match driver.prepare(&run).await {
                    Ok(()) if run.context().description().nodes.is_empty() => {
                        WorkflowEvent::ComponentsFinished
                    }
                    Ok(()) => WorkflowEvent::PrepareAttemptSuccessful,
                    Err(e) => WorkflowEvent::AttemptFailed(e),
                },
                DriverAction::Start => match driver.start(&run).await {
                    Ok(()) => return,
                    Err(e) => WorkflowEvent::AttemptFailed(e),
                },
                DriverAction::Pause => match driver.pause(&run).await {
                    Ok(()) => WorkflowEvent::PauseAttemptSuccessful,
                    Err(e) => WorkflowEvent::AttemptFailed(e),
                },
                DriverAction::Resume => match driver.resume(&run).await {
                    Ok(()) => WorkflowEvent::ResumeAttemptSuccessful,
                    Err(e) => WorkflowEvent::AttemptFailed(e),
                },
                DriverAction::Cancel => match driver.cancel(&run).await {
                    Ok(()) => WorkflowEvent::CancelAttemptSuccessful,
                    Err(e) => WorkflowEvent::CancelAttemptFailed(e.reason),
                },
                DriverAction::Dispose => match driver.dispose(&run).await {
                    Ok(()) => WorkflowEvent::DisposeAttemptSuccessful,
                    Err(e) => WorkflowEvent::DisposeAttemptFailed(e.reason),
                },
            };
            events.post(event);
        });
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: WorkflowState) {
        self.lock().state = state;
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NoopComponentsDriver;
    use crate::store::InMemoryRunStore;
    use async_trait::async_trait;
    use rce_notification::NotificationConfig;
    use rce_types::{NodeId, WorkflowDescription, WorkflowExecutionContextBuilder, WorkflowNode};

    const WAIT: Duration = Duration::from_secs(2);

    fn create_test_machine(
        driver: Arc<dyn ComponentsDriver>,
        with_nodes: bool,
    ) -> (Arc<WorkflowStateMachine>, Arc<NotificationService>, Arc<InMemoryRunStore>) {
        let mut description = WorkflowDescription::new("wf", 5);
        if with_nodes {
            description = description.with_node(WorkflowNode::new("Script", "script", "1.0"));
        }
        let context = WorkflowExecutionContextBuilder::new(description)
            .node_id_of_origin(NodeId::new("local"))
            .build()
            .unwrap();
        let notifications = NotificationService::new(NodeId::new("local"), NotificationConfig::default());
        let store = Arc::new(InMemoryRunStore::new());
        let id = ExecutionId::generate();
        let run_id = store.add_run(&id, "wf", "wf_1");
        let machine = WorkflowStateMachine::new(
            id,
            Arc::new(context),
            run_id,
            driver,
            notifications.clone(),
            store.clone(),
        );
        (machine, notifications, store)
    }

    struct FailingPrepare;

    #[async_trait]
    impl ComponentsDriver for FailingPrepare {
        async fn prepare(&self, _run: &DriverContext) -> std::result::Result<(), DriverError> {
            Err(DriverError::new("prepare", "tool missing"))
        }
    }

    struct FailingCancel;

    #[async_trait]
    impl ComponentsDriver for FailingCancel {
        async fn cancel(&self, _run: &DriverContext) -> std::result::Result<(), DriverError> {
            Err(DriverError::new("cancel", "component does not react"))
        }
    }

    #[test]
    fn test_user_operations_follow_state_predicates() {
        let user_events = [
            WorkflowEvent::PauseRequested,
            WorkflowEvent::ResumeRequested,
            WorkflowEvent::CancelRequested,
            WorkflowEvent::DisposeRequested,
        ];
        for state in WorkflowState::ALL {
            for event in &user_events {
                let legal = match event {
                    WorkflowEvent::PauseRequested => state.is_pausable(),
                    WorkflowEvent::ResumeRequested => state.is_resumable(),
                    WorkflowEvent::CancelRequested => state.is_cancellable(),
                    _ => state.is_disposable(),
                };
                assert_eq!(
                    next_state(state, event, false).is_some(),
                    legal,
                    "{:?} in {}",
                    event,
                    state
                );
            }
        }
    }

    #[test]
    fn test_failure_after_user_cancel_ends_cancelled() {
        use WorkflowState as S;
        let failed = WorkflowEvent::AttemptFailed(DriverError::new("cancel", "x"));
        assert_eq!(next_state(S::Canceling, &failed, true), Some(S::CancelingAfterFailed));
        assert_eq!(
            next_state(S::CancelingAfterFailed, &WorkflowEvent::CancelAttemptSuccessful, true),
            Some(S::Cancelled)
        );
        assert_eq!(
            next_state(S::CancelingAfterFailed, &WorkflowEvent::CancelAttemptSuccessful, false),
            Some(S::Failed)
        );
        assert_eq!(
            next_state(
                S::CancelingAfterResultsRejected,
                &WorkflowEvent::CancelAttemptSuccessful,
                false
            ),
            Some(S::ResultsRejected)
        );
    }

    #[tokio::test]
    async fn test_happy_path_to_disposed() {
        let (machine, notifications, store) =
            create_test_machine(Arc::new(NoopComponentsDriver::completing()), true);

        assert_eq!(machine.start().unwrap(), WorkflowState::Starting);
        assert!(machine.wait_for_state(WorkflowState::Finished, WAIT).await);
        assert_eq!(
            store.run(machine.run_id).unwrap().final_state,
            Some(WorkflowState::Finished)
        );

        machine.dispose().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Disposed, WAIT).await);

        let history = notifications
            .get_notifications(&format!("{}.*", STATE_TOPIC_PREFIX.replace('.', "\\.")))
            .unwrap();
        let states: Vec<WorkflowState> = history
            .values()
            .flatten()
            .filter_map(|r| match StateNotification::from_body(&r.body) {
                Some(StateNotification::NewState { state }) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                WorkflowState::Starting,
                WorkflowState::Preparing,
                WorkflowState::Running,
                WorkflowState::Finished,
                WorkflowState::Disposing,
                WorkflowState::Disposed,
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_workflow_finishes_from_preparing() {
        let (machine, _, _) = create_test_machine(Arc::new(NoopComponentsDriver::new()), false);
        machine.start().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Finished, WAIT).await);
    }

    #[tokio::test]
    async fn test_pause_resume_cancel() {
        let (machine, _, _) = create_test_machine(Arc::new(NoopComponentsDriver::new()), true);
        machine.start().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Running, WAIT).await);

        assert!(machine.resume().is_err());
        machine.pause().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Paused, WAIT).await);
        machine.resume().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Running, WAIT).await);
        machine.cancel().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Cancelled, WAIT).await);
        assert!(machine.cancel().is_err());
    }

    #[tokio::test]
    async fn test_illegal_request_leaves_state_unchanged() {
        let (machine, _, _) = create_test_machine(Arc::new(NoopComponentsDriver::new()), true);
        machine.force_state(WorkflowState::Paused);

        let err = machine.pause().unwrap_err();
        assert!(matches!(
            err,
            WorkflowExecutionError::InvalidState {
                current: WorkflowState::Paused,
                operation: "pause",
                ..
            }
        ));
        assert!(machine.dispose().is_err());
        assert_eq!(machine.state(), WorkflowState::Paused);
    }

    #[tokio::test]
    async fn test_prepare_failure_ends_failed() {
        let (machine, _, store) = create_test_machine(Arc::new(FailingPrepare), true);
        machine.start().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Failed, WAIT).await);
        assert!(machine.failure().unwrap().contains("tool missing"));
        assert_eq!(
            store.run(machine.run_id).unwrap().final_state,
            Some(WorkflowState::Failed)
        );
    }

    #[tokio::test]
    async fn test_cancel_failure_ends_failed() {
        let (machine, _, _) = create_test_machine(Arc::new(FailingCancel), true);
        machine.start().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Running, WAIT).await);
        machine.cancel().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Failed, WAIT).await);
    }

    #[tokio::test]
    async fn test_heartbeat_lost_while_running() {
        let (machine, _, _) = create_test_machine(Arc::new(NoopComponentsDriver::new()), true);
        machine.start().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Running, WAIT).await);

        machine
            .event_sender()
            .post(WorkflowEvent::ComponentHeartbeatLost("Script".into()));
        assert!(machine.wait_for_state(WorkflowState::Failed, WAIT).await);
        assert!(machine.failure().unwrap().contains("Script"));
    }

    #[tokio::test]
    async fn test_results_rejected() {
        let (machine, _, _) = create_test_machine(Arc::new(NoopComponentsDriver::new()), true);
        machine.start().unwrap();
        assert!(machine.wait_for_state(WorkflowState::Running, WAIT).await);
        machine
            .event_sender()
            .post(WorkflowEvent::ResultsRejected("bad output".into()));
        assert!(machine.wait_for_state(WorkflowState::ResultsRejected, WAIT).await);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_event() -> impl Strategy<Value = WorkflowEvent> {
            prop_oneof![
                Just(WorkflowEvent::StartRequested),
                Just(WorkflowEvent::StartAttemptSuccessful),
                Just(WorkflowEvent::PrepareAttemptSuccessful),
                Just(WorkflowEvent::PauseRequested),
                Just(WorkflowEvent::PauseAttemptSuccessful),
                Just(WorkflowEvent::ResumeRequested),
                Just(WorkflowEvent::ResumeAttemptSuccessful),
                Just(WorkflowEvent::CancelRequested),
                Just(WorkflowEvent::CancelAttemptSuccessful),
                Just(WorkflowEvent::CancelAttemptFailed("cancel".into())),
                Just(WorkflowEvent::DisposeRequested),
                Just(WorkflowEvent::DisposeAttemptSuccessful),
                Just(WorkflowEvent::DisposeAttemptFailed("dispose".into())),
                Just(WorkflowEvent::ComponentsFinished),
                Just(WorkflowEvent::ResultsRejected("rejected".into())),
                Just(WorkflowEvent::AttemptFailed(DriverError::new("run", "broken"))),
                Just(WorkflowEvent::ComponentHeartbeatLost("component".into())),
            ]
        }

        proptest! {
            #[test]
            fn property_random_events_only_take_legal_transitions(
                events in proptest::collection::vec(arb_event(), 0..40),
            ) {
                let mut state = WorkflowState::Init;
                let mut cancel_requested = false;
                let mut started = false;

                for event in &events {
                    let Some(next) = next_state(state, event, cancel_requested) else {
                        continue;
                    };

                    prop_assert!(
                        !matches!(next, WorkflowState::Init | WorkflowState::Unknown | WorkflowState::IsAlive),
                        "{} -> {}", state, next
                    );
                    prop_assert_ne!(state, WorkflowState::Disposed);
                    if state.is_final() {
                        prop_assert_eq!(next, WorkflowState::Disposing);
                    }
                    if next.is_final() {
                        prop_assert!(started);
                    }
                    if next.is_final() && cancel_requested {
                        prop_assert!(
                            matches!(next, WorkflowState::Cancelled | WorkflowState::Failed | WorkflowState::Finished),
                            "{} after user cancel", next
                        );
                    }
                    if next.is_final() && cancel_requested && matches!(event, WorkflowEvent::CancelAttemptSuccessful) {
                        prop_assert_eq!(next, WorkflowState::Cancelled);
                    }

                    started |= next == WorkflowState::Starting;
                    cancel_requested |= matches!(event, WorkflowEvent::CancelRequested);
                    state = next;
                }
            }

            #[test]
            fn property_disposed_is_absorbing(
                events in proptest::collection::vec(arb_event(), 0..20),
                cancel_requested in any::<bool>(),
            ) {
                for event in &events {
                    prop_assert_eq!(next_state(WorkflowState::Disposed, event, cancel_requested), None);
                }
            }
        }
    }
}

