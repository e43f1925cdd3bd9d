//! Tests for the CLI module
//!
//! Argument parsing and layered configuration loading.
