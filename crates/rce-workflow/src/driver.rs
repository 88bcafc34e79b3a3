//! Seam between the workflow state machine and the components of a run
//!
//! The state machine decides *when* components are prepared, started,
//! paused and so on; a [`ComponentsDriver`] does the actual work and reports
//! back. Each attempt's outcome is turned into a state machine event.

use crate::error::DriverError;
use crate::state_machine::{WorkflowEvent, WorkflowEventSender};
use async_trait::async_trait;
use rce_types::{ExecutionId, WorkflowExecutionContext};
use std::sync::Arc;

/// What a driver gets to see of a run
#[derive(Clone)]
pub struct DriverContext {
    execution_id: ExecutionId,
    context: Arc<WorkflowExecutionContext>,
    events: WorkflowEventSender,
}

impl DriverContext {
    pub(crate) fn new(
        execution_id: ExecutionId,
        context: Arc<WorkflowExecutionContext>,
        events: WorkflowEventSender,
    ) -> Self {
        Self {
            execution_id,
            context,
            events,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn context(&self) -> &WorkflowExecutionContext {
        &self.context
    }

    /// All components reached their end
    pub fn components_finished(&self) {
        self.events.post(WorkflowEvent::ComponentsFinished);
    }

    /// Produced results were not accepted
    pub fn results_rejected(&self, reason: impl Into<String>) {
        self.events.post(WorkflowEvent::ResultsRejected(reason.into()));
    }

    /// A component stopped sending heartbeats
    pub fn component_heartbeat_lost(&self, component: impl Into<String>) {
        self.events
            .post(WorkflowEvent::ComponentHeartbeatLost(component.into()));
    }
}

/// Performs the component side of each lifecycle step.
///
/// Every method defaults to immediate success.
#[async_trait]
pub trait ComponentsDriver: Send + Sync {
    /// Controller side setup while STARTING
    async fn initialize(&self, _run: &DriverContext) -> Result<(), DriverError> {
        Ok(())
    }

    /// Instantiate and prepare components while PREPARING
    async fn prepare(&self, _run: &DriverContext) -> Result<(), DriverError> {
        Ok(())
    }

    /// Start the prepared components; completion is reported later through
    /// [`DriverContext::components_finished`]
    async fn start(&self, _run: &DriverContext) -> Result<(), DriverError> {
        Ok(())
    }

    async fn pause(&self, _run: &DriverContext) -> Result<(), DriverError> {
        Ok(())
    }

    async fn resume(&self, _run: &DriverContext) -> Result<(), DriverError> {
        Ok(())
    }

    async fn cancel(&self, _run: &DriverContext) -> Result<(), DriverError> {
        Ok(())
    }

    async fn dispose(&self, _run: &DriverContext) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Driver without real components
#[derive(Debug, Default, Clone)]
pub struct NoopComponentsDriver {
    complete_on_start: bool,
}

impl NoopComponentsDriver {
    /// Runs stay RUNNING until finished from outside
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs finish as soon as they started
    pub fn completing() -> Self {
        Self {
            complete_on_start: true,
        }
    }
}

#[async_trait]
impl ComponentsDriver for NoopComponentsDriver {
    async fn start(&self, run: &DriverContext) -> Result<(), DriverError> {
        if self.complete_on_start {
            run.components_finished();
        }
        Ok(())
    }
}
