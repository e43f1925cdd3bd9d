//! Consumer Tests
//!
//! Tests for flow control, lease management and the pull consumer,
//! organized by component.

mod consumer;
mod helpers;
