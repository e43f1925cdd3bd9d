//! Public API for the publisher
//!
//! External modules should import from here rather than directly from
//! internal modules.

pub use crate::publisher::accumulator::{BatchAccumulator, BatchSettings};
pub use crate::publisher::error::{PublishError, PublishResult};
pub use crate::publisher::message::{Batch, OutboundMessage};
pub use crate::publisher::publisher::{
    BatchReport, MessageOutcome, PublishHandle, PublishSummary, Publisher, PublisherSettings,
};
