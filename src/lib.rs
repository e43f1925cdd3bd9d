pub mod app;
pub mod broker;
pub mod core;
pub mod notifications;
pub mod publisher;
pub mod subscriber;
