//! Command-line interface for the warehouse loader

pub mod commands;
pub mod error;

pub use error::CliError;
