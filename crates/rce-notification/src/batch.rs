//! Size- and time-bounded batch aggregation
//!
//! Items are collected on a background task and handed to a processor
//! either when `max_batch_size` items are pending or when the oldest pending
//! item has waited `max_latency`, whichever happens first. Items are always
//! delivered in enqueue order.

use crate::error::{NotificationError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Receives the batches produced by a [`BatchAggregator`]
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync + 'static {
    async fn process_batch(&self, batch: Vec<T>);
}

/// Collects items and forwards them in bounded batches
pub struct BatchAggregator<T> {
    sender: mpsc::UnboundedSender<T>,
}

impl<T: Send + 'static> BatchAggregator<T> {
    /// Spawn the aggregation task. Must be called from within a tokio runtime.
    pub fn new(
        max_batch_size: usize,
        max_latency: Duration,
        processor: Arc<dyn BatchProcessor<T>>,
    ) -> Self {
        let batch_size = max_batch_size.max(1);
        let (sender, mut receiver) = mpsc::unbounded_channel::<T>();

        tokio::spawn(async move {
            let mut pending: Vec<T> = Vec::new();
            let mut deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    maybe_item = receiver.recv() => {
                        match maybe_item {
                            Some(item) => {
                                if pending.is_empty() {
                                    deadline = Some(Instant::now() + max_latency);
                                }
                                pending.push(item);
                                if pending.len() >= batch_size {
                                    deadline = None;
                                    processor.process_batch(std::mem::take(&mut pending)).await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        if !pending.is_empty() {
                            processor.process_batch(std::mem::take(&mut pending)).await;
                        }
                    }
                }
            }

            if !pending.is_empty() {
                processor.process_batch(pending).await;
            }
            debug!("Batch aggregator stopped");
        });

        Self { sender }
    }

    /// Queue an item for the next batch
    pub fn enqueue(&self, item: T) -> Result<()> {
        self.sender
            .send(item)
            .map_err(|_| NotificationError::ChannelClosed)
    }
}

/// Processor that forwards every batch into an unbounded channel
pub struct ChannelBatchSink<T> {
    sender: mpsc::UnboundedSender<Vec<T>>,
}

impl<T: Send + 'static> ChannelBatchSink<T> {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<T>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

#[async_trait]
impl<T: Send + 'static> BatchProcessor<T> for ChannelBatchSink<T> {
    async fn process_batch(&self, batch: Vec<T>) {
        // receiver gone means nobody is interested any more
        let _ = self.sender.send(batch);
    }
}
