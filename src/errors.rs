//! Hub error types and their HTTP dispositions.

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use crate::pages;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("invalid credentials for user '{user}'")]
    AuthFailure { user: String },

    #[error("session capacity reached ({max} sessions)")]
    CapacityExceeded { max: u32 },

    #[error("orchestrator unavailable: {0}")]
    OrchestratorUnavailable(String),

    #[error("could not launch a session container for '{user}': {reason}")]
    ContainerLaunchFailed { user: String, reason: String },

    #[error("a session for user '{user}' already exists")]
    SessionConflict { user: String },

    #[error("proxy reload failed: {0}")]
    ProxyReloadFailed(String),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl HubError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::AuthFailure { .. } | HubError::CapacityExceeded { .. } => {
                StatusCode::UNAUTHORIZED
            }
            HubError::NotFound { .. } => StatusCode::NOT_FOUND,
            HubError::SessionConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = pages::error_page(status, &self.to_string());
        (status, Html(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_is_401() {
        let err = HubError::AuthFailure {
            user: "someone".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_capacity_is_401() {
        let err = HubError::CapacityExceeded { max: 1 };
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_not_found_is_404() {
        let err = HubError::NotFound {
            what: "session".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
