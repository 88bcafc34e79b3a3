//! Latest known state of every execution seen on the state topics

use crate::state_machine::{StateNotification, STATE_TOPIC_PREFIX};
use async_trait::async_trait;
use dashmap::DashMap;
use rce_notification::{BatchProcessor, CatchUpProcessor};
use rce_types::{ExecutionId, NotificationRecord, WorkflowState};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, trace};

/// Consumes ordered state notifications, as delivered by a
/// [`CatchUpProcessor`], and remembers the last state per execution.
///
/// Once an execution reaches a final state its catch-up bookkeeping is
/// dropped from the attached processor.
#[derive(Default)]
pub struct WorkflowStateTracker {
    states: DashMap<ExecutionId, WorkflowState>,
    processor: OnceLock<Weak<CatchUpProcessor>>,
}

impl WorkflowStateTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Processor feeding this tracker; only the first call has an effect
    pub fn attach(&self, processor: &Arc<CatchUpProcessor>) {
        let _ = self.processor.set(Arc::downgrade(processor));
    }

    pub fn state(&self, execution_id: &ExecutionId) -> Option<WorkflowState> {
        self.states.get(execution_id).map(|s| *s)
    }

    pub fn tracked_count(&self) -> usize {
        self.states.len()
    }

    fn apply(&self, record: &NotificationRecord) {
        let Some(id) = record.topic.as_str().strip_prefix(STATE_TOPIC_PREFIX) else {
            return;
        };
        let Some(StateNotification::NewState { state }) = StateNotification::from_body(&record.body)
        else {
            trace!(topic = %record.topic, "Ignoring non-state notification");
            return;
        };

        let execution_id = ExecutionId::new(id);
        debug!(execution_id = %execution_id, state = %state, "Execution state changed");
        self.states.insert(execution_id, state);

        if state.is_final() || state == WorkflowState::Disposed {
            if let Some(processor) = self.processor.get().and_then(Weak::upgrade) {
                processor.forget_topic(&record.topic);
            }
        }
    }
}

#[async_trait]
impl BatchProcessor<NotificationRecord> for WorkflowStateTracker {
    async fn process_batch(&self, batch: Vec<NotificationRecord>) {
        for record in &batch {
            self.apply(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::state_topic;
    use rce_notification::NotificationConfig;
    use rce_types::{CatchUpKey, NodeId};

    fn state_record(id: &ExecutionId, number: u64, state: WorkflowState) -> NotificationRecord {
        NotificationRecord::new(
            state_topic(id),
            NodeId::new("host"),
            number,
            StateNotification::NewState { state }.to_body(),
        )
    }

    #[tokio::test]
    async fn test_tracks_latest_state_and_ignores_heartbeats() {
        let tracker = WorkflowStateTracker::new();
        let id = ExecutionId::new("e1");
        let alive = NotificationRecord::new(
            state_topic(&id),
            NodeId::new("host"),
            2,
            StateNotification::IsAlive.to_body(),
        );

        tracker
            .process_batch(vec![
                state_record(&id, 0, WorkflowState::Starting),
                state_record(&id, 1, WorkflowState::Running),
                alive,
            ])
            .await;

        assert_eq!(tracker.state(&id), Some(WorkflowState::Running));
        assert_eq!(tracker.tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_final_state_releases_catch_up_bookkeeping() {
        let config = NotificationConfig {
            batch_max_latency_ms: 5,
            ..Default::default()
        };
        let tracker = WorkflowStateTracker::new();
        let processor = CatchUpProcessor::new("tracker", &config, tracker.clone());
        tracker.attach(&processor);

        let id = ExecutionId::new("e2");
        let key = CatchUpKey::new(state_topic(&id), NodeId::new("host"));
        processor.process_live(vec![state_record(&id, 0, WorkflowState::Running)]);
        assert_eq!(processor.last_delivered(&key), Some(0));

        processor.process_live(vec![state_record(&id, 1, WorkflowState::Finished)]);
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while processor.tracked_count() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(tracker.state(&id), Some(WorkflowState::Finished));
    }
}
