//! Error types shared by both daemons

use thiserror::Error;

/// DormNet common error type
#[derive(Error, Debug)]
pub enum CommonError {
    /// Text could not be parsed as a MAC address
    #[error("\"{0}\" is not a valid MAC address")]
    InvalidMac(String),

    /// Text could not be parsed as an IPv4 address
    #[error("unrecognized ipv4 \"{0}\"")]
    InvalidAddress(String),

    /// Wire document carries a version this build does not understand
    #[error("unsupported document version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the document
        found: u32,
        /// Version this build writes
        expected: u32,
    },

    /// Rate limiter constructed with a zero limit
    #[error("rate limit must be greater than 0")]
    InvalidLimit,

    /// JSON encode/decode failure
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Result type for DormNet common operations
pub type CommonResult<T> = Result<T, CommonError>;
