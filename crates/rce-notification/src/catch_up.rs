//! Ordered merge of backfilled and live notifications
//!
//! A subscriber that attaches to a publisher late gets, per topic, the number
//! of the newest notification it missed. Until everything up to that number
//! has been fetched and delivered, live notifications for the topic are held
//! back in a pending queue. Delivery downstream is strictly increasing per
//! `(topic, node)` pair; numbers at or below the last delivered one are dropped.
//!
//! A catch-up that does not complete within the configured timeout is ended
//! anyway: the pair is flagged stale, the pending queue is flushed and live
//! delivery resumes.

use crate::batch::{BatchAggregator, BatchProcessor};
use crate::config::NotificationConfig;
use crate::error::Result;
use crate::subscriber::NotificationSubscriber;
use async_trait::async_trait;
use rce_types::{CatchUpKey, CurrentNumbers, NodeId, NotificationRecord, TopicId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per `(topic, node)` bookkeeping
#[derive(Debug, Default)]
struct CatchUpLedger {
    last_missed: Option<u64>,
    catching_up: bool,
    pending: Vec<NotificationRecord>,
    last_delivered: Option<u64>,
    stale: bool,
    generation: u64,
    deadline: Option<Instant>,
}

impl CatchUpLedger {
    fn is_new(&self, number: u64) -> bool {
        self.last_delivered.map_or(true, |d| number > d)
    }

    fn reached_last_missed(&self) -> bool {
        match (self.last_missed, self.last_delivered) {
            (Some(missed), Some(delivered)) => delivered >= missed,
            (None, _) => true,
            _ => false,
        }
    }

    fn take_pending_sorted(&mut self) -> Vec<NotificationRecord> {
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|r| r.number);
        pending
    }
}

#[derive(Default)]
struct CatchUpState {
    ledgers: HashMap<CatchUpKey, CatchUpLedger>,
    /// Nodes with a subscribe call in flight; their live records are queued
    holding: HashMap<NodeId, usize>,
}

/// Receives notifications for one logical subscriber and forwards them
/// downstream in order, filling gaps from publisher history first.
pub struct CatchUpProcessor {
    id: String,
    catch_up_timeout: Duration,
    state: Mutex<CatchUpState>,
    output: BatchAggregator<NotificationRecord>,
    self_ref: Weak<CatchUpProcessor>,
}

impl CatchUpProcessor {
    /// Create a processor delivering through a batch aggregator into `downstream`.
    /// Must be called from within a tokio runtime.
    pub fn new(
        id: impl Into<String>,
        config: &NotificationConfig,
        downstream: Arc<dyn BatchProcessor<NotificationRecord>>,
    ) -> Arc<Self> {
        let output = BatchAggregator::new(
            config.batch_max_size,
            config.batch_max_latency(),
            downstream,
        );
        let catch_up_timeout = config.catch_up_timeout();
        let id = id.into();
        Arc::new_cyclic(|self_ref| Self {
            id,
            catch_up_timeout,
            state: Mutex::new(CatchUpState::default()),
            output,
            self_ref: self_ref.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CatchUpState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Runs under the state lock so downstream order equals decision order.
    fn deliver(&self, ledger: &mut CatchUpLedger, record: NotificationRecord) {
        if !ledger.is_new(record.number) {
            debug!(topic = %record.topic, number = record.number, "Dropping already delivered notification");
            return;
        }
        ledger.last_delivered = Some(record.number);
        if self.output.enqueue(record).is_err() {
            warn!(subscriber = %self.id, "Downstream closed, notification lost");
        }
    }

    fn flush_pending(&self, ledger: &mut CatchUpLedger) {
        for record in ledger.take_pending_sorted() {
            self.deliver(ledger, record);
        }
    }

    /// Handle notifications pushed by a publisher
    pub fn process_live(&self, batch: Vec<NotificationRecord>) {
        let mut state = self.lock();
        let state = &mut *state;
        for record in batch {
            let held = state.holding.contains_key(&record.publisher);
            let ledger = state.ledgers.entry(record.key()).or_default();
            if ledger.catching_up || held {
                ledger.pending.push(record);
            } else {
                self.deliver(ledger, record);
            }
        }
    }

    /// Call before subscribing at `node`: live records from the node are held
    /// until [`complete_subscription`](Self::complete_subscription) or
    /// [`abort_subscription`](Self::abort_subscription).
    pub fn prepare_subscription(&self, node: &NodeId) {
        *self.lock().holding.entry(node.clone()).or_insert(0) += 1;
    }

    /// Register what the subscribe call at `node` reported as already published
    pub fn complete_subscription(&self, node: &NodeId, current: &CurrentNumbers) {
        let mut state = self.lock();
        for (topic, number) in current {
            if let Some(number) = number {
                let key = CatchUpKey::new(topic.clone(), node.clone());
                self.begin_catch_up_locked(&mut state, key, *number);
            }
        }
        self.release_hold(&mut state, node);
    }

    /// The subscribe call at `node` failed; stop holding its records
    pub fn abort_subscription(&self, node: &NodeId) {
        let mut state = self.lock();
        self.release_hold(&mut state, node);
    }

    fn release_hold(&self, state: &mut CatchUpState, node: &NodeId) {
        let remaining = match state.holding.get_mut(node) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining > 0 {
            return;
        }
        state.holding.remove(node);
        for (key, ledger) in state.ledgers.iter_mut() {
            if &key.node == node && !ledger.catching_up && !ledger.pending.is_empty() {
                self.flush_pending(ledger);
            }
        }
    }

    /// Enter catch-up mode for `key`, everything up to `last_missed` is owed
    pub fn begin_catch_up(&self, key: CatchUpKey, last_missed: u64) {
        let mut state = self.lock();
        self.begin_catch_up_locked(&mut state, key, last_missed);
    }

    fn begin_catch_up_locked(&self, state: &mut CatchUpState, key: CatchUpKey, last_missed: u64) {
        let ledger = state.ledgers.entry(key.clone()).or_default();
        if ledger.last_delivered.map_or(false, |d| d >= last_missed) {
            return;
        }

        ledger.last_missed = Some(last_missed);
        ledger.catching_up = true;
        ledger.stale = false;
        ledger.generation += 1;
        ledger.deadline = Some(Instant::now() + self.catch_up_timeout);
        debug!(key = %key, last_missed, "Catching up");

        let generation = ledger.generation;
        let timeout = self.catch_up_timeout;
        let processor = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(processor) = processor.upgrade() {
                processor.expire(&key, generation);
            }
        });
    }

    /// Merge fetched history for `key` with whatever was queued meanwhile
    pub fn apply_backfill(&self, key: &CatchUpKey, records: Vec<NotificationRecord>) {
        let mut state = self.lock();
        let ledger = state.ledgers.entry(key.clone()).or_default();

        let mut backfill: Vec<NotificationRecord> = records
            .into_iter()
            .filter(|r| r.topic == key.topic)
            .collect();

        let Some(last_missed) = ledger.last_missed.filter(|_| ledger.catching_up) else {
            // catch-up already over (timed out or nothing missed)
            backfill.sort_by_key(|r| r.number);
            for record in backfill {
                self.deliver(ledger, record);
            }
            return;
        };

        let (owed, later): (Vec<_>, Vec<_>) = std::mem::take(&mut ledger.pending)
            .into_iter()
            .partition(|r| r.number <= last_missed);
        ledger.pending = later;
        backfill.retain(|r| r.number <= last_missed);
        backfill.extend(owed);
        backfill.sort_by_key(|r| r.number);
        backfill.dedup_by_key(|r| r.number);

        for record in backfill {
            self.deliver(ledger, record);
        }

        if ledger.reached_last_missed() {
            ledger.catching_up = false;
            ledger.last_missed = None;
            ledger.deadline = None;
            self.flush_pending(ledger);
            debug!(key = %key, "Catch-up complete");
        } else {
            debug!(key = %key, last_missed, delivered = ?ledger.last_delivered, "Backfill incomplete, still catching up");
        }
    }

    fn expire(&self, key: &CatchUpKey, generation: u64) {
        let mut state = self.lock();
        let Some(ledger) = state.ledgers.get_mut(key) else {
            return;
        };
        if !ledger.catching_up || ledger.generation != generation {
            return;
        }
        warn!(
            key = %key,
            last_missed = ?ledger.last_missed,
            delivered = ?ledger.last_delivered,
            "Catch-up timed out, notifications may be missing"
        );
        ledger.catching_up = false;
        ledger.stale = true;
        ledger.last_missed = None;
        ledger.deadline = None;
        self.flush_pending(ledger);
    }

    /// Drop all bookkeeping for a node, e.g. after it left the network
    pub fn forget_node(&self, node: &NodeId) {
        let mut state = self.lock();
        state.ledgers.retain(|key, _| &key.node != node);
        state.holding.remove(node);
        info!(subscriber = %self.id, node = %node, "Forgot catch-up state");
    }

    /// Drop the settled bookkeeping of a topic that will see no more notifications.
    ///
    /// Entries still catching up or holding queued records are kept. Returns
    /// how many entries were removed.
    pub fn forget_topic(&self, topic: &TopicId) -> usize {
        let mut state = self.lock();
        let before = state.ledgers.len();
        state.ledgers.retain(|key, ledger| {
            &key.topic != topic || ledger.catching_up || !ledger.pending.is_empty()
        });
        let removed = before - state.ledgers.len();
        if removed > 0 {
            debug!(subscriber = %self.id, topic = %topic, removed, "Forgot topic");
        }
        removed
    }

    /// Number of `(topic, node)` pairs with bookkeeping
    pub fn tracked_count(&self) -> usize {
        self.lock().ledgers.len()
    }

    pub fn is_catching_up(&self, key: &CatchUpKey) -> bool {
        self.lock().ledgers.get(key).map_or(false, |l| l.catching_up)
    }

    pub fn pending_count(&self, key: &CatchUpKey) -> usize {
        self.lock().ledgers.get(key).map_or(0, |l| l.pending.len())
    }

    /// Whether a catch-up for `key` timed out before completing
    pub fn is_stale(&self, key: &CatchUpKey) -> bool {
        self.lock().ledgers.get(key).map_or(false, |l| l.stale)
    }

    pub fn stale_keys(&self) -> Vec<CatchUpKey> {
        let mut keys: Vec<_> = self
            .lock()
            .ledgers
            .iter()
            .filter(|(_, l)| l.stale)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn last_delivered(&self, key: &CatchUpKey) -> Option<u64> {
        self.lock().ledgers.get(key).and_then(|l| l.last_delivered)
    }

    /// Time left before the running catch-up for `key` is abandoned
    pub fn catch_up_remaining(&self, key: &CatchUpKey) -> Option<Duration> {
        self.lock()
            .ledgers
            .get(key)
            .and_then(|l| l.deadline)
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl NotificationSubscriber for CatchUpProcessor {
    fn subscriber_id(&self) -> &str {
        &self.id
    }

    async fn receive_batch(&self, batch: Vec<NotificationRecord>) -> Result<()> {
        self.process_live(batch);
        Ok(())
    }
}
