//! Publisher Tests
//!
//! Tests for batching, publishing with retries and replication, organized
//! by topic.

mod helpers;
mod publisher;
mod replication;
