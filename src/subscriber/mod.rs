//! Lease-managed Consumer
//!
//! Inbound side of the dispatch core.
//!
//! # Architecture
//!
//! ```text
//! BrokerClient::pull ──▶ FlowController::try_admit ──denied──▶ pause pulling
//!                              │ admitted
//!                              ▼
//!                      worker task (handler)
//!                              │ register
//!                              ▼
//!   extension ticker ──▶ LeaseManager ──complete──▶ acknowledge + release
//!                              └────────abandon──▶ release (broker redelivers)
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use pubsub_dispatch::broker::api::{BrokerClient, InMemoryBroker, SubscriptionKind};
//! use pubsub_dispatch::core::shutdown::ShutdownCoordinator;
//! use pubsub_dispatch::notifications::api::EventBus;
//! use pubsub_dispatch::subscriber::api::{Consumer, ConsumerSettings, InboundMessage, WorkerError};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let topic = broker.create_topic("test", "events").await?;
//! let subscription = broker
//!     .create_subscription("test", "events-sub", &topic, SubscriptionKind::Pull, 30)
//!     .await?;
//!
//! let consumer = Consumer::new(broker, subscription, ConsumerSettings::default(), EventBus::new())?;
//! let report = consumer
//!     .run_for(
//!         |message: InboundMessage, _shutdown| async move {
//!             println!("{}", message.payload_str());
//!             Ok::<(), WorkerError>(())
//!         },
//!         &ShutdownCoordinator::new(),
//!         Some(Duration::from_secs(5)),
//!     )
//!     .await?;
//! println!("acknowledged {}", report.acknowledged);
//! # Ok(())
//! # }
//! ```

pub(crate) mod consumer;
pub(crate) mod error;
pub(crate) mod flow;
pub(crate) mod lease;
pub(crate) mod message;

pub mod api;

#[cfg(test)]
mod tests;
