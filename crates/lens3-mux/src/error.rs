//! Errors that end a request at the Mux.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lens3_registry::RegistryError;
use lens3_state::StateError;
use thiserror::Error;

pub type MuxResult<T> = Result<T, MuxError>;

#[derive(Debug, Error)]
pub enum MuxError {
    /// A check failed; carries its own status.
    #[error("{}", .0.message)]
    Rejected(#[from] RegistryError),

    /// The backend could not be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered with something that is not HTTP.
    #[error("backend protocol error: {0}")]
    Protocol(String),
}

impl From<StateError> for MuxError {
    fn from(e: StateError) -> Self {
        MuxError::Rejected(e.into())
    }
}

impl MuxError {
    pub fn status(&self) -> StatusCode {
        match self {
            MuxError::Rejected(e) => {
                StatusCode::from_u16(e.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            MuxError::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            MuxError::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for MuxError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses() {
        let e = MuxError::from(RegistryError::forbidden("Pool disabled"));
        assert_eq!(e.status(), StatusCode::FORBIDDEN);
        assert_eq!(e.to_string(), "Pool disabled");
        assert_eq!(MuxError::Unreachable("refused".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(MuxError::Protocol("bad".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(MuxError::from(StateError::Backend("down".into())).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
