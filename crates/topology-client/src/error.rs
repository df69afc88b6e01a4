//! Topology client errors

use thiserror::Error;

/// Errors that can occur when talking to the topology manager
#[derive(Debug, Error)]
pub enum TopologyError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The topology manager returned an error
    #[error("Topology API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request rejected or could not be signed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An asynchronous operation did not finish in time
    #[error("Operation timed out: {0}")]
    Timeout(String),
}
