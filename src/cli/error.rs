//! CLI-specific error types

use crate::database::LoadError;
use crate::models::BatchError;
use std::path::PathBuf;
use thiserror::Error;

/// CLI-specific error type
#[derive(Error, Debug)]
pub enum CliError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Batch error: {0}")]
    BatchError(#[from] BatchError),

    #[error("Load error: {0}")]
    LoadError(#[from] LoadError),

    /// The load finished but some chunks were rolled back
    #[error("Load incomplete: {0}")]
    LoadIncomplete(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::LoadIncomplete(_) => 2,
            _ => 1,
        }
    }
}
