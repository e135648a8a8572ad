//! Error types for backend supervision.

use lens3_registry::RegistryError;
use lens3_state::StateError;
use thiserror::Error;

/// Result type alias for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("backend admin failed: {0}")]
    Admin(#[from] RegistryError),

    #[error("manager spawn failed: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ManagerError> for RegistryError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::Admin(e) => e,
            ManagerError::Spawn(_) => RegistryError::unavailable(e.to_string()),
            _ => RegistryError::internal(e.to_string()),
        }
    }
}
