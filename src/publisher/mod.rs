//! Batching Publisher
//!
//! Outbound side of the dispatch core.
//!
//! # Architecture
//!
//! ```text
//!   enqueue(message)                        flush timer (max_latency)
//!         │                                          │
//!         ▼                                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ BatchAccumulator   bytes ≤ max_bytes, count ≤ max_messages │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ completed Batch
//!                 ▼
//! ┌──────────────────────────────┐  retry (RetryPolicy)  ┌────────────┐
//! │ publish task (one per batch) │──────────────────────▶│ BrokerClient│
//! └───────────────┬──────────────┘                       └────────────┘
//!                 │ BatchReport (per-message ids or errors)
//!                 ▼
//!           PublishHandle::wait()
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use pubsub_dispatch::broker::api::{BrokerClient, InMemoryBroker};
//! use pubsub_dispatch::core::shutdown::ShutdownCoordinator;
//! use pubsub_dispatch::notifications::api::EventBus;
//! use pubsub_dispatch::publisher::api::{OutboundMessage, Publisher, PublisherSettings};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let topic = broker.create_topic("test", "events").await?;
//! let publisher = Publisher::new(
//!     broker,
//!     topic,
//!     PublisherSettings::default(),
//!     EventBus::new(),
//!     ShutdownCoordinator::new(),
//! )?;
//!
//! let messages = vec![OutboundMessage::new("hello")];
//! for summary in publisher.publish_all(&messages, 2).await? {
//!     println!("published {} message(s)", summary.published());
//! }
//! # Ok(())
//! # }
//! ```

pub(crate) mod accumulator;
pub(crate) mod error;
pub(crate) mod message;
#[allow(clippy::module_inception)]
pub(crate) mod publisher;

pub mod api;

#[cfg(test)]
mod tests;
