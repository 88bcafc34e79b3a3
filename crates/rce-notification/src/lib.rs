//! RCE notification delivery
//!
//! Sequenced publish/subscribe between nodes with three guarantees on the
//! receiving side:
//!
//! - per `(topic, node)` pair, notifications are delivered in increasing
//!   sequence order and never twice
//! - notifications published before a subscription was made are fetched
//!   from the publisher's history and merged in front of live ones
//! - delivery is batched (size and latency bounded) to limit consumer load
//!
//! ```text
//! NotificationService ──subscribe──► CatchUpProcessor ──BatchAggregator──► consumer
//!        ▲                                  ▲
//!        └──── NotificationRouter ◄──── SubscriptionManager
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod batch;
pub mod catch_up;
pub mod config;
pub mod error;
pub mod manager;
pub mod router;
pub mod service;
pub mod subscriber;

pub use batch::{BatchAggregator, BatchProcessor, ChannelBatchSink};
pub use catch_up::CatchUpProcessor;
pub use config::NotificationConfig;
pub use error::{NotificationError, Result};
pub use manager::{StaticTargets, SubscriptionManager, SubscriptionReport, SubscriptionTargets};
pub use router::{NotificationRouter, RemoteNotificationService};
pub use service::{NotificationService, TopicPattern};
pub use subscriber::NotificationSubscriber;
