//! Error types for the Lens3 state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to connect to the store: {0}")]
    Connect(String),

    #[error("store operation failed: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("unique id generation exhausted after {0} tries")]
    Exhausted(usize),
}
