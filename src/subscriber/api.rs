//! Public API for the consumer
//!
//! External modules should import from here rather than directly from
//! internal modules.

pub use crate::subscriber::consumer::{Consumer, ConsumerReport, ConsumerSettings};
pub use crate::subscriber::error::{SubscribeError, SubscribeResult, WorkerError};
pub use crate::subscriber::flow::{FlowController, FlowStats};
pub use crate::subscriber::lease::{LeaseManager, LeaseOutcome, LeaseStats};
pub use crate::subscriber::message::InboundMessage;
