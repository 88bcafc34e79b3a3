//! Publisher side: the per-node notification service
//!
//! Topics are registered implicitly on first send. Each topic keeps a
//! monotonically increasing sequence number and a bounded history so that
//! late subscribers can fetch what they missed. Subscriptions are regular
//! expressions matched against whole topic names.

use crate::batch::{BatchAggregator, BatchProcessor};
use crate::config::NotificationConfig;
use crate::error::{NotificationError, Result};
use crate::subscriber::NotificationSubscriber;
use async_trait::async_trait;
use rce_types::{CurrentNumbers, NodeId, NotificationRecord, TopicId};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

/// Compiled topic pattern; always matches the complete topic name
#[derive(Debug, Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| {
            NotificationError::InvalidTopicPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Pattern matching every topic that starts with `prefix`
    pub fn for_prefix(prefix: &str) -> Result<Self> {
        Self::new(&format!("{}.*", regex::escape(prefix)))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, topic: &TopicId) -> bool {
        self.regex.is_match(topic.as_str())
    }
}

struct TopicState {
    current: Option<u64>,
    history: VecDeque<NotificationRecord>,
    buffer_size: usize,
}

impl TopicState {
    fn new(buffer_size: usize, current: Option<u64>) -> Self {
        Self {
            current,
            history: VecDeque::new(),
            buffer_size,
        }
    }

    fn trim(&mut self) {
        while self.history.len() > self.buffer_size {
            self.history.pop_front();
        }
    }
}

struct SubscriberEntry {
    patterns: Vec<TopicPattern>,
    aggregator: BatchAggregator<NotificationRecord>,
}

impl SubscriberEntry {
    fn matches(&self, topic: &TopicId) -> bool {
        self.patterns.iter().any(|p| p.matches(topic))
    }
}

#[derive(Default)]
struct PublisherState {
    topics: HashMap<TopicId, TopicState>,
    /// Last number of removed topics; a topic registered again continues from here
    retired: HashMap<TopicId, u64>,
    subscribers: HashMap<String, SubscriberEntry>,
}

impl PublisherState {
    fn topic(&mut self, topic: TopicId, buffer_size: usize) -> &mut TopicState {
        let retired = &mut self.retired;
        self.topics.entry(topic).or_insert_with_key(|topic| {
            TopicState::new(buffer_size, retired.remove(topic))
        })
    }
}

/// Hands batches to one subscriber and drops it on failure
struct SubscriberDispatch {
    subscriber: Arc<dyn NotificationSubscriber>,
    service: Weak<NotificationService>,
}

#[async_trait]
impl BatchProcessor<NotificationRecord> for SubscriberDispatch {
    async fn process_batch(&self, batch: Vec<NotificationRecord>) {
        if let Err(e) = self.subscriber.receive_batch(batch).await {
            let id = self.subscriber.subscriber_id().to_string();
            warn!(subscriber = %id, error = %e, "Subscriber failed, removing all its subscriptions");
            if let Some(service) = self.service.upgrade() {
                service.unsubscribe_all(&id);
            }
        }
    }
}

/// Notification publisher of one node
pub struct NotificationService {
    node_id: NodeId,
    config: NotificationConfig,
    state: Mutex<PublisherState>,
    self_ref: Weak<NotificationService>,
}

impl NotificationService {
    pub fn new(node_id: NodeId, config: NotificationConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            node_id,
            config,
            state: Mutex::new(PublisherState::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn lock(&self) -> MutexGuard<'_, PublisherState> {
        // a panic while holding the lock cannot leave the maps half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a notification; returns its sequence number
    pub fn send(&self, topic: impl Into<TopicId>, body: serde_json::Value) -> u64 {
        let topic = topic.into();
        let mut state = self.lock();
        let default_size = self.config.default_buffer_size;

        let topic_state = state.topic(topic.clone(), default_size);
        let number = topic_state.current.map_or(0, |n| n + 1);
        topic_state.current = Some(number);

        let record = NotificationRecord::new(topic.clone(), self.node_id.clone(), number, body);
        if topic_state.buffer_size > 0 {
            topic_state.history.push_back(record.clone());
            topic_state.trim();
        }

        for (id, entry) in state.subscribers.iter() {
            if entry.matches(&topic) && entry.aggregator.enqueue(record.clone()).is_err() {
                debug!(subscriber = %id, topic = %topic, "Dispatch channel closed");
            }
        }

        number
    }

    /// Subscribe to all topics matching `pattern`.
    ///
    /// Returns the current sequence number of every matching topic. Anything
    /// published after this call is delivered live; anything up to the
    /// returned numbers must be fetched with [`get_notifications`](Self::get_notifications).
    pub fn subscribe(
        &self,
        pattern: &str,
        subscriber: Arc<dyn NotificationSubscriber>,
    ) -> Result<CurrentNumbers> {
        let pattern = TopicPattern::new(pattern)?;
        let id = subscriber.subscriber_id().to_string();

        let mut state = self.lock();
        let entry = state.subscribers.entry(id.clone()).or_insert_with(|| {
            let dispatch = Arc::new(SubscriberDispatch {
                subscriber: subscriber.clone(),
                service: self.self_ref.clone(),
            });
            SubscriberEntry {
                patterns: Vec::new(),
                aggregator: BatchAggregator::new(
                    self.config.batch_max_size,
                    self.config.batch_max_latency(),
                    dispatch,
                ),
            }
        });
        if !entry.patterns.iter().any(|p| p.as_str() == pattern.as_str()) {
            entry.patterns.push(pattern.clone());
        }

        let current = state
            .topics
            .iter()
            .filter(|(topic, _)| pattern.matches(topic))
            .map(|(topic, ts)| (topic.clone(), ts.current))
            .collect();

        debug!(subscriber = %id, pattern = pattern.as_str(), "Subscribed");
        Ok(current)
    }

    /// Remove one subscription; returns whether it existed
    pub fn unsubscribe(&self, pattern: &str, subscriber_id: &str) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.subscribers.get_mut(subscriber_id) else {
            return false;
        };
        let before = entry.patterns.len();
        entry.patterns.retain(|p| p.as_str() != pattern);
        let removed = entry.patterns.len() != before;
        if entry.patterns.is_empty() {
            state.subscribers.remove(subscriber_id);
        }
        removed
    }

    /// Remove every subscription of a subscriber
    pub fn unsubscribe_all(&self, subscriber_id: &str) {
        self.lock().subscribers.remove(subscriber_id);
    }

    /// Buffered history of every topic matching `pattern`
    pub fn get_notifications(
        &self,
        pattern: &str,
    ) -> Result<HashMap<TopicId, Vec<NotificationRecord>>> {
        let pattern = TopicPattern::new(pattern)?;
        let state = self.lock();
        Ok(state
            .topics
            .iter()
            .filter(|(topic, _)| pattern.matches(topic))
            .map(|(topic, ts)| (topic.clone(), ts.history.iter().cloned().collect()))
            .collect())
    }

    /// Change how much history a topic keeps; registers the topic if needed
    pub fn set_buffer_size(&self, topic: impl Into<TopicId>, size: usize) {
        let mut state = self.lock();
        let topic_state = state.topic(topic.into(), size);
        topic_state.buffer_size = size;
        topic_state.trim();
    }

    /// Forget a topic and its history.
    ///
    /// Its sequence number is kept, so notifications sent after the topic is
    /// registered again are never mistaken for ones subscribers already have.
    pub fn remove_publisher(&self, topic: &TopicId) -> bool {
        let mut state = self.lock();
        let Some(removed) = state.topics.remove(topic) else {
            return false;
        };
        if let Some(current) = removed.current {
            state.retired.insert(topic.clone(), current);
        }
        true
    }

    pub fn registered_topics(&self) -> Vec<TopicId> {
        let mut topics: Vec<_> = self.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}
