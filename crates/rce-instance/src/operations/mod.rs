//! Starting and stopping instance processes
//!
//! The process-level work is done by [`ProcessInstanceOperations`]. Cross-cutting
//! behaviour is layered on top by wrapping one [`InstanceOperations`] in another:
//!
//! ```text
//! synchronized( releasing_locks( ProcessInstanceOperations ) )
//!      │               │                    │
//!      │               │                    └─ takes management locks, launches, watches markers
//!      │               └─ releases management locks, removes stale markers on failure
//!      └─ coalesces concurrent requests for the same profile name
//! ```

mod process;
mod release;
mod synchronize;

pub use process::ProcessInstanceOperations;
pub use release::{releasing_locks, LockReleasingOperations};
pub use synchronize::{synchronized, SynchronizingOperations};

use crate::error::InstanceOperationError;
use crate::lock::ManagementLockTable;
use crate::output::TextOutputReceiver;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Result type for process operations
pub type Result<T> = std::result::Result<T, InstanceOperationError>;

/// What happened to one profile of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    Started,
    Stopped,
    /// Shutdown of a profile that was not running; nothing was signalled
    NotRunning,
    /// The management lock of the profile stayed taken
    LockContention,
    Failed(String),
    /// No verdict before the deadline; the process was stopped again
    TimedOut,
}

impl InstanceOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Started | Self::Stopped | Self::NotRunning)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Started => "started".into(),
            Self::Stopped => "stopped".into(),
            Self::NotRunning => "not running".into(),
            Self::LockContention => "management lock unavailable".into(),
            Self::Failed(reason) => reason.clone(),
            Self::TimedOut => "timed out, stopped again".into(),
        }
    }
}

/// Per-profile outcomes of a start or shutdown batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationReport {
    outcomes: BTreeMap<String, InstanceOutcome>,
}

impl OperationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, profile: impl Into<String>, outcome: InstanceOutcome) {
        self.outcomes.insert(profile.into(), outcome);
    }

    pub fn merge(&mut self, other: OperationReport) {
        self.outcomes.extend(other.outcomes);
    }

    pub fn outcome(&self, profile: &str) -> Option<&InstanceOutcome> {
        self.outcomes.get(profile)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = (&str, &InstanceOutcome)> {
        self.outcomes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Profiles with the given outcome
    pub fn with_outcome(&self, outcome: &InstanceOutcome) -> Vec<&str> {
        self.outcomes()
            .filter(|(_, o)| *o == outcome)
            .map(|(p, _)| p)
            .collect()
    }

    pub fn failures(&self) -> Vec<(&str, &InstanceOutcome)> {
        self.outcomes().filter(|(_, o)| !o.is_success()).collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(InstanceOutcome::is_success)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn failure_summary(&self) -> String {
        self.failures()
            .iter()
            .map(|(p, o)| format!("{}: {}", p, o.describe()))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Launches and terminates instances on profile directories
#[async_trait]
pub trait InstanceOperations: Send + Sync {
    /// Start one instance per profile from `installation`, waiting at most
    /// `timeout` for each to report readiness
    async fn start_instances(
        &self,
        profiles: Vec<PathBuf>,
        installation: PathBuf,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport>;

    async fn shutdown_instances(
        &self,
        profiles: Vec<PathBuf>,
        timeout: Duration,
        output: Arc<dyn TextOutputReceiver>,
    ) -> Result<OperationReport>;
}

/// The standard chain around a process-level implementation
pub fn standard_chain(
    base: Arc<dyn InstanceOperations>,
    locks: Arc<ManagementLockTable>,
) -> Arc<dyn InstanceOperations> {
    synchronized(releasing_locks(base, locks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_summary() {
        let mut report = OperationReport::new();
        report.record("a", InstanceOutcome::Started);
        report.record("b", InstanceOutcome::Failed("exited early".into()));
        report.record("c", InstanceOutcome::TimedOut);

        assert!(!report.is_success());
        assert_eq!(report.with_outcome(&InstanceOutcome::Started), vec!["a"]);
        assert_eq!(
            report.failure_summary(),
            "b: exited early; c: timed out, stopped again"
        );

        let mut other = OperationReport::new();
        other.record("b", InstanceOutcome::Started);
        report.merge(other);
        assert_eq!(report.outcome("b"), Some(&InstanceOutcome::Started));
        assert_eq!(report.len(), 3);
    }
}
