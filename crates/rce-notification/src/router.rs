//! Access to the notification services of other nodes

use crate::error::{NotificationError, Result};
use crate::service::NotificationService;
use crate::subscriber::NotificationSubscriber;
use async_trait::async_trait;
use dashmap::DashMap;
use rce_types::{CurrentNumbers, NodeId, NotificationRecord, TopicId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Subscribe to and fetch from the notification service of any node
#[async_trait]
pub trait RemoteNotificationService: Send + Sync {
    async fn subscribe(
        &self,
        node: &NodeId,
        pattern: &str,
        subscriber: Arc<dyn NotificationSubscriber>,
    ) -> Result<CurrentNumbers>;

    async fn unsubscribe(&self, node: &NodeId, pattern: &str, subscriber_id: &str) -> Result<()>;

    async fn get_notifications(
        &self,
        node: &NodeId,
        pattern: &str,
    ) -> Result<HashMap<TopicId, Vec<NotificationRecord>>>;
}

/// Routes calls to the publisher registered for a node.
///
/// Every call is bounded by `call_timeout` so an unresponsive node cannot
/// stall a subscriber.
pub struct NotificationRouter {
    services: DashMap<NodeId, Arc<NotificationService>>,
    call_timeout: Duration,
}

impl NotificationRouter {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            services: DashMap::new(),
            call_timeout,
        }
    }

    pub fn register(&self, service: Arc<NotificationService>) {
        info!(node = %service.node_id(), "Registered notification service");
        self.services.insert(service.node_id().clone(), service);
    }

    pub fn deregister(&self, node: &NodeId) -> bool {
        let removed = self.services.remove(node).is_some();
        if removed {
            info!(node = %node, "Deregistered notification service");
        }
        removed
    }

    pub fn service(&self, node: &NodeId) -> Result<Arc<NotificationService>> {
        self.services
            .get(node)
            .map(|s| s.value().clone())
            .ok_or_else(|| NotificationError::PublisherUnavailable(node.clone()))
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    async fn bounded<T, F>(&self, operation: &'static str, node: &NodeId, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| NotificationError::timeout(operation, node, self.call_timeout))?
    }
}

#[async_trait]
impl RemoteNotificationService for NotificationRouter {
    async fn subscribe(
        &self,
        node: &NodeId,
        pattern: &str,
        subscriber: Arc<dyn NotificationSubscriber>,
    ) -> Result<CurrentNumbers> {
        let service = self.service(node)?;
        debug!(node = %node, pattern, "Remote subscribe");
        self.bounded("subscribe", node, async move { service.subscribe(pattern, subscriber) })
            .await
    }

    async fn unsubscribe(&self, node: &NodeId, pattern: &str, subscriber_id: &str) -> Result<()> {
        let service = self.service(node)?;
        self.bounded("unsubscribe", node, async move {
            service.unsubscribe(pattern, subscriber_id);
            Ok(())
        })
        .await
    }

    async fn get_notifications(
        &self,
        node: &NodeId,
        pattern: &str,
    ) -> Result<HashMap<TopicId, Vec<NotificationRecord>>> {
        let service = self.service(node)?;
        self.bounded("get_notifications", node, async move {
            service.get_notifications(pattern)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;

    struct NullSubscriber;

    #[async_trait]
    impl NotificationSubscriber for NullSubscriber {
        fn subscriber_id(&self) -> &str {
            "null"
        }

        async fn receive_batch(&self, _batch: Vec<NotificationRecord>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unknown_node_is_unavailable() {
        let router = NotificationRouter::new(Duration::from_secs(1));
        let err = router
            .get_notifications(&NodeId::new("ghost"), ".*")
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::PublisherUnavailable(_)));
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_routes_to_registered_service() {
        let router = NotificationRouter::new(Duration::from_secs(1));
        let node = NodeId::new("n1");
        let service = NotificationService::new(node.clone(), NotificationConfig::default());
        service.send("topic", serde_json::json!("hello"));
        router.register(service);

        let current = router
            .subscribe(&node, "top.*", Arc::new(NullSubscriber))
            .await
            .unwrap();
        assert_eq!(current[&TopicId::new("topic")], Some(0));

        let history = router.get_notifications(&node, "topic").await.unwrap();
        assert_eq!(history[&TopicId::new("topic")].len(), 1);

        assert!(router.deregister(&node));
        assert!(router.nodes().is_empty());
    }
}
