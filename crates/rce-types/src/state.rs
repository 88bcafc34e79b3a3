//! Workflow lifecycle states
//!
//! The state is owned and mutated by the workflow state machine on the
//! controller node; everybody else only ever sees snapshots of it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Controller created, nothing started yet
    #[default]
    Init,
    /// Start requested, controller is launching
    Starting,
    /// Components are being prepared
    Preparing,
    /// Components are executing
    Running,
    /// Pause requested
    Pausing,
    /// Execution is paused
    Paused,
    /// Resume requested
    Resuming,
    /// All components finished
    Finished,
    /// Cancel requested by a user
    Canceling,
    /// Cancelling because something failed
    CancelingAfterFailed,
    /// Cancelling because results were rejected
    CancelingAfterResultsRejected,
    /// Cancelled
    Cancelled,
    /// Failed
    Failed,
    /// Results were rejected
    ResultsRejected,
    /// Dispose requested
    Disposing,
    /// Resources released, run is gone
    Disposed,
    /// State could not be determined
    Unknown,
    /// Liveness heartbeat, never a real state
    IsAlive,
}

impl WorkflowState {
    /// All states, in lifecycle order
    pub const ALL: [WorkflowState; 18] = [
        Self::Init,
        Self::Starting,
        Self::Preparing,
        Self::Running,
        Self::Pausing,
        Self::Paused,
        Self::Resuming,
        Self::Finished,
        Self::Canceling,
        Self::CancelingAfterFailed,
        Self::CancelingAfterResultsRejected,
        Self::Cancelled,
        Self::Failed,
        Self::ResultsRejected,
        Self::Disposing,
        Self::Disposed,
        Self::Unknown,
        Self::IsAlive,
    ];

    /// Terminal outcome of a run ("final workflow state")
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Cancelled | Self::Failed | Self::ResultsRejected
        )
    }

    pub fn is_pausable(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Paused)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Dispose is only possible once the run reached a final state
    pub fn is_disposable(&self) -> bool {
        self.is_final()
    }

    /// States for which the controller keeps sending liveness heartbeats
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Init
                | Self::Starting
                | Self::Preparing
                | Self::Running
                | Self::Pausing
                | Self::Paused
                | Self::Resuming
                | Self::Canceling
                | Self::CancelingAfterFailed
                | Self::CancelingAfterResultsRejected
        )
    }

    /// Whether the state may be shown to users (IS_ALIVE never is)
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::IsAlive)
    }

    /// Wire name (`RUNNING`, `CANCELING_AFTER_FAILED`, ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Starting => "STARTING",
            Self::Preparing => "PREPARING",
            Self::Running => "RUNNING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Resuming => "RESUMING",
            Self::Finished => "FINISHED",
            Self::Canceling => "CANCELING",
            Self::CancelingAfterFailed => "CANCELING_AFTER_FAILED",
            Self::CancelingAfterResultsRejected => "CANCELING_AFTER_RESULTS_REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::ResultsRejected => "RESULTS_REJECTED",
            Self::Disposing => "DISPOSING",
            Self::Disposed => "DISPOSED",
            Self::Unknown => "UNKNOWN",
            Self::IsAlive => "IS_ALIVE",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown state name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown workflow state: {0}")]
pub struct UnknownStateError(pub String);

impl FromStr for WorkflowState {
    type Err = UnknownStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownStateError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_states() {
        let finals: Vec<_> = WorkflowState::ALL
            .iter()
            .filter(|s| s.is_final())
            .collect();
        assert_eq!(
            finals,
            vec![
                &WorkflowState::Finished,
                &WorkflowState::Cancelled,
                &WorkflowState::Failed,
                &WorkflowState::ResultsRejected
            ]
        );
    }

    #[test]
    fn test_user_operation_predicates() {
        for state in WorkflowState::ALL {
            assert_eq!(state.is_pausable(), state == WorkflowState::Running);
            assert_eq!(state.is_resumable(), state == WorkflowState::Paused);
            assert_eq!(
                state.is_cancellable(),
                matches!(state, WorkflowState::Running | WorkflowState::Paused)
            );
        }
    }

    #[test]
    fn test_active_and_final_are_disjoint() {
        for state in WorkflowState::ALL {
            assert!(!(state.is_active() && state.is_final()), "{}", state);
        }
        assert!(!WorkflowState::Disposed.is_active());
        assert!(!WorkflowState::IsAlive.is_user_visible());
    }

    #[test]
    fn test_parse_round_trip_names() {
        for state in WorkflowState::ALL {
            assert_eq!(state.as_str().parse::<WorkflowState>(), Ok(state));
        }
        assert!("WALKING".parse::<WorkflowState>().is_err());
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&WorkflowState::CancelingAfterResultsRejected).unwrap();
        assert_eq!(json, "\"CANCELING_AFTER_RESULTS_REJECTED\"");
    }
}
