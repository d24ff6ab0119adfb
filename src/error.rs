//! Error types for GraphOptima
//!
//! Contention on a work unit lock is flow control, not an error, and never
//! shows up here. Everything in this enum is either locally recoverable by the
//! caller or operator-actionable.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// GraphOptima error types
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline artifact exists but its content cannot be used
    #[error("Malformed artifact {}: {reason}", path.display())]
    MalformedArtifact {
        /// Path of the offending artifact
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Raw metrics cannot be turned into a reward
    #[error("Malformed metrics: {0}\nExpected exactly 7 readability values")]
    MalformedMetrics(String),

    /// Parameter vector arity does not match the configured arity
    #[error("Dimension mismatch: expected {expected} parameters, got {actual}")]
    DimensionMismatch {
        /// Configured arity
        expected: usize,
        /// Arity of the rejected vector
        actual: usize,
    },

    /// Cluster scheduler command failed
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Stage transformation failed
    #[error("Stage '{stage}' failed: {reason}")]
    Stage {
        /// Stage name
        stage: String,
        /// Failure description
        reason: String,
    },

    /// Invalid input parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error (non-transient; busy/locked is retried before surfacing)
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
