//! Error handling - flat, cheap to match on at tick boundaries

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// aleph-broker error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket / file IO
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed request line or market-state message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Replay tape could not be read
    #[error("Replay error: {0}")]
    Replay(String),

    /// Per-tick operation budget (or brokerage quota) exhausted
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Bounded wait on the brokerage expired
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Brokerage rejected or failed a call
    #[error("Brokerage error: {0}")]
    Brokerage(String),

    /// Unknown instrument code
    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    /// Call made in the wrong tick phase
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::RateLimited(_))
    }
}
