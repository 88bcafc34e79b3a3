//! Workflow controllers and the per-node service hosting them

use crate::config::WorkflowExecutionConfig;
use crate::driver::ComponentsDriver;
use crate::error::{Result, WorkflowExecutionError};
use crate::state_machine::{state_topic, StateNotification, WorkflowStateMachine};
use crate::store::RunDataStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rce_notification::NotificationService;
use rce_types::{
    ExecutionId, NodeId, WorkflowExecutionContext, WorkflowExecutionHandle,
    WorkflowExecutionInformation, WorkflowState,
};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

/// Controller of one workflow run
pub struct WorkflowExecutionController {
    handle: WorkflowExecutionHandle,
    context: Arc<WorkflowExecutionContext>,
    start_time: DateTime<Utc>,
    run_id: u64,
    machine: Arc<WorkflowStateMachine>,
}

impl WorkflowExecutionController {
    pub fn handle(&self) -> &WorkflowExecutionHandle {
        &self.handle
    }

    pub fn context(&self) -> &WorkflowExecutionContext {
        &self.context
    }

    pub fn state_machine(&self) -> &Arc<WorkflowStateMachine> {
        &self.machine
    }

    pub fn state(&self) -> WorkflowState {
        self.machine.state()
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn information(&self) -> WorkflowExecutionInformation {
        WorkflowExecutionInformation {
            handle: self.handle.clone(),
            instance_name: self.context.instance_name().to_string(),
            workflow_name: self.context.description().name.clone(),
            node_id_starting: self.context.node_id_of_origin().clone(),
            state: self.machine.state(),
            start_time: self.start_time,
            additional_information: self.context.additional_information().map(str::to_string),
            data_management_id: Some(self.run_id),
        }
    }
}

/// Controller operations of a node, callable locally or from other nodes
#[async_trait]
pub trait WorkflowExecutionControllerService: Send + Sync {
    /// Instantiate a controller in INIT
    async fn create_execution_controller(
        &self,
        context: WorkflowExecutionContext,
    ) -> Result<WorkflowExecutionInformation>;

    async fn start(&self, execution_id: &ExecutionId) -> Result<()>;

    async fn pause(&self, execution_id: &ExecutionId) -> Result<()>;

    async fn resume(&self, execution_id: &ExecutionId) -> Result<()>;

    async fn cancel(&self, execution_id: &ExecutionId) -> Result<()>;

    async fn dispose(&self, execution_id: &ExecutionId) -> Result<()>;

    /// Drop a controller that never left INIT, together with its run record
    async fn discard_execution_controller(&self, execution_id: &ExecutionId) -> Result<()>;

    async fn get_state(&self, execution_id: &ExecutionId) -> Result<WorkflowState>;

    async fn get_data_management_id(&self, execution_id: &ExecutionId) -> Result<u64>;

    /// Remove the run record; only for runs that are over
    async fn delete_from_data_management(&self, execution_id: &ExecutionId) -> Result<()>;

    async fn get_execution_informations(&self) -> Result<Vec<WorkflowExecutionInformation>>;
}

/// Hosts the controllers of the local node
pub struct LocalControllerService {
    node_id: NodeId,
    config: WorkflowExecutionConfig,
    controllers: DashMap<ExecutionId, Arc<WorkflowExecutionController>>,
    /// Held from the instance name check until the new controller is registered
    creation: Mutex<()>,
    driver: Arc<dyn ComponentsDriver>,
    notifications: Arc<NotificationService>,
    store: Arc<dyn RunDataStore>,
}

impl LocalControllerService {
    pub fn new(
        node_id: NodeId,
        config: WorkflowExecutionConfig,
        driver: Arc<dyn ComponentsDriver>,
        notifications: Arc<NotificationService>,
        store: Arc<dyn RunDataStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            config,
            controllers: DashMap::new(),
            creation: Mutex::new(()),
            driver,
            notifications,
            store,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn controller(&self, execution_id: &ExecutionId) -> Result<Arc<WorkflowExecutionController>> {
        self.controllers
            .get(execution_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| WorkflowExecutionError::controller_unavailable(execution_id))
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// Publish IS_ALIVE for every active run; returns how many were sent
    pub fn send_heartbeats(&self) -> usize {
        let mut sent = 0;
        for entry in self.controllers.iter() {
            if entry.value().state().is_active() {
                self.notifications
                    .send(state_topic(entry.key()), StateNotification::IsAlive.to_body());
                sent += 1;
            }
        }
        sent
    }

    /// Start the periodic heartbeat; stops once the service is dropped
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                let sent = service.send_heartbeats();
                debug!(sent, "Sent workflow heartbeats");
            }
        })
    }
}

#[async_trait]
impl WorkflowExecutionControllerService for LocalControllerService {
    #[instrument(skip(self, context), fields(workflow = %context.description().name))]
    async fn create_execution_controller(
        &self,
        context: WorkflowExecutionContext,
    ) -> Result<WorkflowExecutionInformation> {
        let _creation = self.creation.lock().unwrap_or_else(|p| p.into_inner());
        let name_taken = self.controllers.iter().any(|c| {
            c.context().instance_name() == context.instance_name()
                && !c.state().is_final()
                && c.state() != WorkflowState::Disposed
        });
        if name_taken {
            return Err(WorkflowExecutionError::DuplicateExecution(
                context.instance_name().to_string(),
            ));
        }

        let execution_id = ExecutionId::generate();
        let context = Arc::new(context);
        let run_id = self.store.add_run(
            &execution_id,
            &context.description().name,
            context.instance_name(),
        );
        self.notifications
            .set_buffer_size(state_topic(&execution_id), self.config.state_topic_buffer_size);

        let machine = WorkflowStateMachine::new(
            execution_id.clone(),
            context.clone(),
            run_id,
            self.driver.clone(),
            self.notifications.clone(),
            self.store.clone(),
        );
        let controller = Arc::new(WorkflowExecutionController {
            handle: WorkflowExecutionHandle::new(execution_id.clone(), self.node_id.clone()),
            context,
            start_time: Utc::now(),
            run_id,
            machine,
        });
        let information = controller.information();
        self.controllers.insert(execution_id.clone(), controller);

        info!(execution_id = %execution_id, run_id, "Created workflow controller");
        Ok(information)
    }

    async fn start(&self, execution_id: &ExecutionId) -> Result<()> {
        self.controller(execution_id)?.state_machine().start()?;
        Ok(())
    }

    async fn pause(&self, execution_id: &ExecutionId) -> Result<()> {
        self.controller(execution_id)?.state_machine().pause()?;
        Ok(())
    }

    async fn resume(&self, execution_id: &ExecutionId) -> Result<()> {
        self.controller(execution_id)?.state_machine().resume()?;
        Ok(())
    }

    async fn cancel(&self, execution_id: &ExecutionId) -> Result<()> {
        self.controller(execution_id)?.state_machine().cancel()?;
        Ok(())
    }

    async fn dispose(&self, execution_id: &ExecutionId) -> Result<()> {
        self.controller(execution_id)?.state_machine().dispose()?;
        Ok(())
    }

    async fn discard_execution_controller(&self, execution_id: &ExecutionId) -> Result<()> {
        let controller = self.controller(execution_id)?;
        let state = controller.state();
        if state != WorkflowState::Init {
            return Err(WorkflowExecutionError::invalid_state(
                execution_id,
                state,
                "discard",
            ));
        }
        self.controllers.remove(execution_id);
        self.notifications.remove_publisher(&state_topic(execution_id));
        self.store.delete_run(controller.run_id())?;
        info!(execution_id = %execution_id, "Discarded workflow controller that was never started");
        Ok(())
    }

    async fn get_state(&self, execution_id: &ExecutionId) -> Result<WorkflowState> {
        Ok(self.controller(execution_id)?.state())
    }

    async fn get_data_management_id(&self, execution_id: &ExecutionId) -> Result<u64> {
        Ok(self.controller(execution_id)?.run_id())
    }

    async fn delete_from_data_management(&self, execution_id: &ExecutionId) -> Result<()> {
        let controller = self.controller(execution_id)?;
        let state = controller.state();
        if !(state.is_final() || state == WorkflowState::Disposed) {
            return Err(WorkflowExecutionError::invalid_state(
                execution_id,
                state,
                "delete",
            ));
        }
        self.store.delete_run(controller.run_id())?;
        self.controllers.remove(execution_id);
        self.notifications.remove_publisher(&state_topic(execution_id));
        info!(execution_id = %execution_id, "Deleted workflow run");
        Ok(())
    }

    async fn get_execution_informations(&self) -> Result<Vec<WorkflowExecutionInformation>> {
        Ok(self.controllers.iter().map(|c| c.information()).collect())
    }
}
