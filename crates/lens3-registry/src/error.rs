//! Structured errors carrying an HTTP-like status.

use lens3_state::StateError;
use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// A `(status, reason)` pair. The API layer turns it into a response as is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("({status}) {message}")]
pub struct RegistryError {
    pub status: u16,
    pub message: String,
}

impl RegistryError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(503, message)
    }
}

impl From<StateError> for RegistryError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Exhausted(_) => Self::internal(e.to_string()),
            _ => Self::internal(format!("store failure: {e}")),
        }
    }
}
