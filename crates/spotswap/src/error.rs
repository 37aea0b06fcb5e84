//! Error types for the engine

use std::time::Duration;
use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

const CAPACITY_MARKERS: &[&str] = &[
    "InsufficientInstanceCapacity",
    "MaxSpotInstanceCountExceeded",
    "SpotMaxPriceTooLow",
    "capacity-not-available",
    "capacity-oversubscribed",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "Throttling",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "timeout",
    "dispatch failure",
    "connector error",
];

/// Errors that can occur while driving a region
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Error bubbled up from the core crate
    #[error(transparent)]
    Core(#[from] spotswap_core::CoreError),

    /// Cloud API error
    #[error("{service} error during {operation}: {message}")]
    Api {
        /// Service that failed
        service: &'static str,
        /// Operation that failed
        operation: &'static str,
        /// Error detail
        message: String,
    },

    /// Spot capacity is not available for the requested type/zone
    #[error("spot capacity unavailable: {0}")]
    Capacity(String),

    /// Bounded wait expired
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Instance disappeared mid-flight
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    /// Event envelope could not be classified
    #[error("event error: {0}")]
    Event(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    fn api(service: &'static str, operation: &'static str, message: String) -> Self {
        if CAPACITY_MARKERS.iter().any(|m| message.contains(m)) {
            return Self::Capacity(message);
        }
        Self::Api {
            service,
            operation,
            message,
        }
    }

    /// Convert from a compute SDK error
    pub fn ec2<E>(operation: &'static str, err: E) -> Self
    where
        aws_sdk_ec2::Error: From<E>,
    {
        Self::api("ec2", operation, aws_sdk_ec2::Error::from(err).to_string())
    }

    /// Convert from an autoscaling SDK error
    pub fn autoscaling<E>(operation: &'static str, err: E) -> Self
    where
        aws_sdk_autoscaling::Error: From<E>,
    {
        Self::api(
            "autoscaling",
            operation,
            aws_sdk_autoscaling::Error::from(err).to_string(),
        )
    }

    /// Convert from a CloudFormation SDK error
    pub fn cloudformation<E>(operation: &'static str, err: E) -> Self
    where
        aws_sdk_cloudformation::Error: From<E>,
    {
        Self::api(
            "cloudformation",
            operation,
            aws_sdk_cloudformation::Error::from(err).to_string(),
        )
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { message, .. } => TRANSIENT_MARKERS.iter().any(|m| message.contains(m)),
            Self::Timeout(_) => false,
            _ => false,
        }
    }
}
