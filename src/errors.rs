use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

use crate::scanner::{InvalidUserId, PersistenceError};

const ENABLE_LOGS: bool = true;

use crate::log_error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(persistence) = err.downcast_ref::<PersistenceError>() {
            return Self::from_persistence(persistence);
        }
        log_error!("Request failed: {err:#}");
        Self::internal(err.to_string())
    }
}

impl From<InvalidUserId> for AppError {
    fn from(_: InvalidUserId) -> Self {
        Self::bad_request("Invalid user_id format")
    }
}

impl From<PersistenceError> for AppError {
    fn from(err: PersistenceError) -> Self {
        Self::from_persistence(&err)
    }
}

impl AppError {
    fn from_persistence(err: &PersistenceError) -> Self {
        log_error!("Persistence failed: {err}");
        match err {
            PersistenceError::Timeout { .. } | PersistenceError::Transient { .. } => {
                Self::unavailable("Storage is busy, try again")
            }
            PersistenceError::Fatal { .. } | PersistenceError::Closed => {
                Self::internal("Database operation failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn invalid_user_ids_are_bad_requests() {
        let err = AppError::from(InvalidUserId("x".into()));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Invalid user_id format");
    }

    #[test]
    fn wrapped_persistence_timeouts_map_to_unavailable() {
        let err = anyhow::Error::new(PersistenceError::Timeout {
            operation: "save_state",
            timeout: Duration::from_millis(5),
            attempts: 3,
        });
        assert_eq!(AppError::from(err).status, StatusCode::SERVICE_UNAVAILABLE);

        let fatal = AppError::from(PersistenceError::Closed);
        assert_eq!(fatal.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
