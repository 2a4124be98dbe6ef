//! Error types for the core library.

use thiserror::Error;

/// Errors that can occur in core operations.
///
/// Per-address outcomes (unknown mailbox, unreachable mail exchanger) are
/// never reported through this type; they end up in a
/// [`ProbeResult`](crate::ProbeResult) instead.
#[derive(Debug, Error)]
pub enum Error {
    /// SMTP layer error.
    #[error("SMTP error: {0}")]
    Smtp(#[from] mxprobe_smtp::Error),

    /// DNS resolver could not be built or queried.
    #[error("DNS error: {0}")]
    Dns(String),

    /// Cache backend failure.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Address is not of the form `local@domain`.
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    /// A batch job was submitted without addresses.
    #[error("Batch contains no addresses")]
    EmptyBatch,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The job queue has been shut down.
    #[error("Job queue is closed")]
    QueueClosed,

    /// No job with this request id is known.
    #[error("Job not found: {0}")]
    JobNotFound(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
