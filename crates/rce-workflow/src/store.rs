//! Run records kept for data management

use crate::error::{Result, WorkflowExecutionError};
use chrono::{DateTime, Utc};
use rce_types::{ExecutionId, WorkflowState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Persistent record of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: u64,
    pub execution_id: ExecutionId,
    pub workflow_name: String,
    pub instance_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub final_state: Option<WorkflowState>,
}

/// Storage backend for run records
pub trait RunDataStore: Send + Sync {
    /// Register a new run and return its data management id
    fn add_run(&self, execution_id: &ExecutionId, workflow_name: &str, instance_name: &str) -> u64;

    /// Record end time and final state
    fn finish_run(&self, run_id: u64, final_state: WorkflowState) -> Result<()>;

    fn delete_run(&self, run_id: u64) -> Result<()>;

    fn run(&self, run_id: u64) -> Option<RunRecord>;
}

/// Run store living in memory only
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    next_id: AtomicU64,
    runs: RwLock<HashMap<u64, RunRecord>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> WorkflowExecutionError {
        WorkflowExecutionError::DataManagement("run store lock poisoned".into())
    }
}

impl RunDataStore for InMemoryRunStore {
    fn add_run(&self, execution_id: &ExecutionId, workflow_name: &str, instance_name: &str) -> u64 {
        let run_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = RunRecord {
            run_id,
            execution_id: execution_id.clone(),
            workflow_name: workflow_name.to_string(),
            instance_name: instance_name.to_string(),
            start_time: Utc::now(),
            end_time: None,
            final_state: None,
        };
        if let Ok(mut runs) = self.runs.write() {
            runs.insert(run_id, record);
        }
        run_id
    }

    fn finish_run(&self, run_id: u64, final_state: WorkflowState) -> Result<()> {
        let mut runs = self.runs.write().map_err(|_| Self::poisoned())?;
        let record = runs.get_mut(&run_id).ok_or_else(|| {
            WorkflowExecutionError::DataManagement(format!("unknown run {}", run_id))
        })?;
        record.end_time = Some(Utc::now());
        record.final_state = Some(final_state);
        Ok(())
    }

    fn delete_run(&self, run_id: u64) -> Result<()> {
        let mut runs = self.runs.write().map_err(|_| Self::poisoned())?;
        runs.remove(&run_id)
            .map(|_| ())
            .ok_or_else(|| WorkflowExecutionError::DataManagement(format!("unknown run {}", run_id)))
    }

    fn run(&self, run_id: u64) -> Option<RunRecord> {
        self.runs.read().ok()?.get(&run_id).cloned()
    }
}
