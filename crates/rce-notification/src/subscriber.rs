//! Subscriber side of the publish/subscribe contract

use crate::error::Result;
use async_trait::async_trait;
use rce_types::NotificationRecord;

/// Something that wants to receive notifications from a publisher.
///
/// Batches arrive in publish order per topic. Returning an error tells the
/// publisher to drop every subscription of this subscriber.
#[async_trait]
pub trait NotificationSubscriber: Send + Sync {
    /// Stable identity, used to match subscribe and unsubscribe calls
    fn subscriber_id(&self) -> &str;

    async fn receive_batch(&self, batch: Vec<NotificationRecord>) -> Result<()>;
}
