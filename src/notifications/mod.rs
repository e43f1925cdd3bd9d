//! Observability events
//!
//! The publisher, lease manager and consumer report what they do on an
//! [`EventBus`](api::EventBus) handed to them at construction. Nothing in
//! the dispatch path depends on anyone listening.

// Internal modules - all access should go through api module
pub(crate) mod error;
pub(crate) mod event;
pub(crate) mod manager;

// Public API module - the only public interface for the notification system
pub mod api;
