//! Application module

pub mod cli;
pub mod commands;
pub mod data_files;
pub mod error;
pub mod startup;
