//! Subscribing a catch-up processor to many nodes at once

use crate::catch_up::CatchUpProcessor;
use crate::error::{NotificationError, Result};
use crate::router::RemoteNotificationService;
use crate::service::TopicPattern;
use crate::subscriber::NotificationSubscriber;
use async_trait::async_trait;
use futures::future::join_all;
use rce_types::{CatchUpKey, NodeId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

/// Source of the nodes a subscription manager should cover
#[async_trait]
pub trait SubscriptionTargets: Send + Sync {
    async fn workflow_host_nodes(&self) -> Vec<NodeId>;
}

/// Fixed target list
pub struct StaticTargets(pub Vec<NodeId>);

#[async_trait]
impl SubscriptionTargets for StaticTargets {
    async fn workflow_host_nodes(&self) -> Vec<NodeId> {
        self.0.clone()
    }
}

/// Outcome of one [`SubscriptionManager::update_subscriptions`] run
#[derive(Debug, Default)]
pub struct SubscriptionReport {
    pub succeeded: Vec<(NodeId, String)>,
    pub failed: Vec<(NodeId, String, NotificationError)>,
}

impl SubscriptionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Keeps one [`CatchUpProcessor`] subscribed to a set of topic prefixes on
/// every workflow host node.
pub struct SubscriptionManager {
    remote: Arc<dyn RemoteNotificationService>,
    targets: Arc<dyn SubscriptionTargets>,
    processor: Arc<CatchUpProcessor>,
    subscribed: Mutex<HashSet<(NodeId, String)>>,
}

impl SubscriptionManager {
    pub fn new(
        remote: Arc<dyn RemoteNotificationService>,
        targets: Arc<dyn SubscriptionTargets>,
        processor: Arc<CatchUpProcessor>,
    ) -> Self {
        Self {
            remote,
            targets,
            processor,
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    pub fn processor(&self) -> &Arc<CatchUpProcessor> {
        &self.processor
    }

    fn subscribed(&self) -> std::sync::MutexGuard<'_, HashSet<(NodeId, String)>> {
        self.subscribed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_subscribed(&self, node: &NodeId, prefix: &str) -> bool {
        self.subscribed().contains(&(node.clone(), prefix.to_string()))
    }

    /// Subscribe to every prefix on every target node not yet covered.
    ///
    /// All node/prefix pairs run concurrently. Failures are logged and
    /// reported but never abort the other pairs.
    #[instrument(skip(self, prefixes))]
    pub async fn update_subscriptions(&self, prefixes: &[&str]) -> SubscriptionReport {
        let nodes = self.targets.workflow_host_nodes().await;
        let pairs: Vec<(NodeId, String)> = {
            let subscribed = self.subscribed();
            nodes
                .iter()
                .flat_map(|node| prefixes.iter().map(move |p| (node.clone(), p.to_string())))
                .filter(|pair| !subscribed.contains(pair))
                .collect()
        };
        debug!(pairs = pairs.len(), "Updating subscriptions");

        let outcomes = join_all(pairs.into_iter().map(|(node, prefix)| async move {
            let result = self.subscribe_one(&node, &prefix).await;
            (node, prefix, result)
        }))
        .await;

        let mut report = SubscriptionReport::default();
        for (node, prefix, result) in outcomes {
            match result {
                Ok(()) => {
                    self.subscribed().insert((node.clone(), prefix.clone()));
                    report.succeeded.push((node, prefix));
                }
                Err(e) => {
                    warn!(node = %node, prefix = %prefix, error = %e, "Subscription failed");
                    report.failed.push((node, prefix, e));
                }
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Subscriptions updated"
        );
        report
    }

    async fn subscribe_one(&self, node: &NodeId, prefix: &str) -> Result<()> {
        let pattern = TopicPattern::for_prefix(prefix)?;

        self.processor.prepare_subscription(node);
        let current = match self
            .remote
            .subscribe(node, pattern.as_str(), self.processor.clone())
            .await
        {
            Ok(current) => current,
            Err(e) => {
                self.processor.abort_subscription(node);
                return Err(e);
            }
        };
        self.processor.complete_subscription(node, &current);

        let missed: Vec<_> = current
            .iter()
            .filter(|(_, n)| n.is_some())
            .map(|(topic, _)| topic.clone())
            .collect();
        if missed.is_empty() {
            return Ok(());
        }

        // a failed fetch leaves the topics to the catch-up timeout
        let mut history = self.remote.get_notifications(node, pattern.as_str()).await?;
        for topic in missed {
            let records = history.remove(&topic).unwrap_or_default();
            self.processor
                .apply_backfill(&CatchUpKey::new(topic, node.clone()), records);
        }
        Ok(())
    }

    /// A node left the network: its subscriptions and catch-up state are gone
    /// and it is subscribed afresh should it come back
    pub fn forget_node(&self, node: &NodeId) {
        self.subscribed().retain(|(n, _)| n != node);
        self.processor.forget_node(node);
    }

    /// Drop every subscription made by this manager
    pub async fn unsubscribe_all(&self) {
        let pairs: Vec<_> = self.subscribed().drain().collect();
        let id = self.processor.subscriber_id().to_string();
        let results = join_all(pairs.iter().map(|(node, prefix)| {
            let id = id.clone();
            async move {
                let pattern = TopicPattern::for_prefix(prefix)?;
                self.remote.unsubscribe(node, pattern.as_str(), &id).await
            }
        }))
        .await;
        for ((node, prefix), result) in pairs.iter().zip(results) {
            if let Err(e) = result {
                warn!(node = %node, prefix = %prefix, error = %e, "Unsubscribe failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ChannelBatchSink;
    use crate::config::NotificationConfig;
    use crate::router::NotificationRouter;
    use crate::service::NotificationService;
    use rce_types::NotificationRecord;
    use std::time::Duration;

    fn create_test_setup(
        nodes: &[&str],
    ) -> (
        Arc<NotificationRouter>,
        SubscriptionManager,
        tokio::sync::mpsc::UnboundedReceiver<Vec<NotificationRecord>>,
    ) {
        let config = NotificationConfig {
            batch_max_latency_ms: 5,
            ..Default::default()
        };
        let router = Arc::new(NotificationRouter::new(Duration::from_secs(1)));
        let (sink, rx) = ChannelBatchSink::<NotificationRecord>::new();
        let processor = CatchUpProcessor::new("gui", &config, sink);
        let targets = StaticTargets(nodes.iter().map(|n| NodeId::new(*n)).collect());
        let manager = SubscriptionManager::new(router.clone(), Arc::new(targets), processor);
        (router, manager, rx)
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_block_others() {
        let (router, manager, _rx) = create_test_setup(&["up", "down"]);
        router.register(NotificationService::new(
            NodeId::new("up"),
            NotificationConfig::default(),
        ));

        let report = manager.update_subscriptions(&["rce.state:"]).await;
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, NodeId::new("down"));
        assert!(manager.is_subscribed(&NodeId::new("up"), "rce.state:"));
        assert!(!manager.is_subscribed(&NodeId::new("down"), "rce.state:"));
    }

    #[tokio::test]
    async fn test_second_update_only_retries_missing() {
        let (router, manager, _rx) = create_test_setup(&["a"]);
        router.register(NotificationService::new(NodeId::new("a"), NotificationConfig::default()));

        let first = manager.update_subscriptions(&["x", "y"]).await;
        assert_eq!(first.succeeded.len(), 2);
        let second = manager.update_subscriptions(&["x", "y"]).await;
        assert!(second.succeeded.is_empty());
        assert!(second.is_complete());
    }

    #[tokio::test]
    async fn test_unsubscribe_all_clears_publisher() {
        let (router, manager, _rx) = create_test_setup(&["a"]);
        let service = NotificationService::new(NodeId::new("a"), NotificationConfig::default());
        router.register(service.clone());

        manager.update_subscriptions(&["x"]).await;
        assert_eq!(service.subscriber_count(), 1);
        manager.unsubscribe_all().await;
        assert_eq!(service.subscriber_count(), 0);
        assert!(!manager.is_subscribed(&NodeId::new("a"), "x"));
    }

    #[tokio::test]
    async fn test_forgotten_node_is_subscribed_again() {
        let (router, manager, _rx) = create_test_setup(&["a"]);
        let first = NotificationService::new(NodeId::new("a"), NotificationConfig::default());
        router.register(first.clone());
        manager.update_subscriptions(&["x"]).await;
        assert!(manager.is_subscribed(&NodeId::new("a"), "x"));

        // node restarts with a fresh publisher
        router.deregister(&NodeId::new("a"));
        manager.forget_node(&NodeId::new("a"));
        assert!(!manager.is_subscribed(&NodeId::new("a"), "x"));

        let second = NotificationService::new(NodeId::new("a"), NotificationConfig::default());
        router.register(second.clone());
        let report = manager.update_subscriptions(&["x"]).await;
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(second.subscriber_count(), 1);
    }
}
