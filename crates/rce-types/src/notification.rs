//! Notification records exchanged between publishers and subscribers

use crate::{NodeId, TopicId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current sequence number per topic as returned by `subscribe`.
///
/// `None` means nothing has been published on the topic yet, so the
/// subscriber missed nothing.
pub type CurrentNumbers = HashMap<TopicId, Option<u64>>;

/// A single sequenced notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub topic: TopicId,
    /// Node that published the notification
    pub publisher: NodeId,
    /// Per-topic sequence number, strictly increasing per publisher
    pub number: u64,
    pub body: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(topic: TopicId, publisher: NodeId, number: u64, body: serde_json::Value) -> Self {
        Self {
            topic,
            publisher,
            number,
            body,
            timestamp: Utc::now(),
        }
    }

    /// Key of the ordering domain this record belongs to
    pub fn key(&self) -> CatchUpKey {
        CatchUpKey::new(self.topic.clone(), self.publisher.clone())
    }
}

/// Ordering domain of notifications: one topic as published by one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatchUpKey {
    pub topic: TopicId,
    pub node: NodeId,
}

impl CatchUpKey {
    pub fn new(topic: TopicId, node: NodeId) -> Self {
        Self { topic, node }
    }
}

impl std::fmt::Display for CatchUpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.topic, self.node)
    }
}
