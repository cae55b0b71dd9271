//! Errors returned by every fallible `viera_client` operation.

use thiserror::Error;

/// Result type used throughout the crate for expected domain failures.
pub type Outcome<T> = Result<T, VieraError>;

/// Errors returned from the client back to the caller.
///
/// Every variant carries a descriptive message. Callers decide how (or whether) to present it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum VieraError {
    /// The TV could not be reached, or a request to it failed or timed out.
    #[error("connectivity error: {0}")]
    Connectivity(String),
    /// The TV replied, but an expected element was missing or unreadable.
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    /// The TV no longer recognizes the encrypted session, and recovering it failed.
    #[error("session invalidated: {0}")]
    SessionInvalidated(String),
    /// Wrong PIN, or missing/unusable credentials for a TV which requires encryption.
    #[error("authentication error: {0}")]
    Authentication(String),
    /// The TV is reachable but in standby (e.g. the app list is empty).
    #[error("TV is in standby: {0}")]
    Standby(String),
    /// The requested operation does not apply to this TV.
    #[error("invalid use: {0}")]
    Misuse(String),
    /// An internal invariant was violated. Not expected to happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VieraError {
    /// Whether the error describes a TV which could not be talked to at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, VieraError::Connectivity(_))
    }
}

impl From<reqwest::Error> for VieraError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            VieraError::Connectivity(format!("request timed out: {e}"))
        } else {
            VieraError::Connectivity(e.to_string())
        }
    }
}

// ================================================================================================
// Tests
