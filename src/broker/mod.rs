//! Broker Collaborator
//!
//! The managed message broker is an external collaborator. This module
//! defines the narrow contract the dispatch core relies on
//! ([`BrokerClient`](api::BrokerClient)), the handle and message types it
//! exchanges, the closed error taxonomy used by the retry policy, and an
//! in-process implementation used by the CLI and the test suites.

pub(crate) mod error;
pub(crate) mod memory;
pub(crate) mod traits;
pub(crate) mod types;

// Public API module - the only public interface for the broker layer
pub mod api;
