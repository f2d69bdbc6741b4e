//! Error types for shared-store, limiter, and configuration failures.
//!
//! The gate never surfaces these as HTTP 5xx: store failures are handled
//! fail-open at the call site, and only startup errors are fatal.

use thiserror::Error;

/// Errors from the shared Redis store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection pool could not be built or is exhausted.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// A Redis command or script failed (including timeouts).
    #[error("redis command failed: {0}")]
    Command(#[from] deadpool_redis::redis::RedisError),

    /// A stored payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors from the token-bucket evaluator.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// Caller passed a non-positive rate, burst, or cost.
    #[error("invalid limiter parameters: rps={rps} burst={burst} cost={cost}")]
    InvalidParams { rps: f64, burst: i64, cost: i64 },

    /// The shared store rejected or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors loading or validating the policy file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The policy file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The policy file is not valid YAML or does not match the schema.
    #[error("failed to parse policy file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is structurally valid but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
