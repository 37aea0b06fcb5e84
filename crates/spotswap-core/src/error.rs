//! Error types for the core crate

use thiserror::Error;

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by configuration parsing and catalog construction
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Instance type missing from the static dataset
    #[error("unknown instance type: {0}")]
    UnknownInstanceType(String),

    /// Static dataset could not be parsed
    #[error("instance dataset error: {0}")]
    Dataset(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
