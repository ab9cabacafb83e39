//! Core error type for the Cadence orchestration core.
//!
//! `OrchestrationError` is used throughout the core domain (stores, services,
//! coordinator). When the `axum` feature is enabled, it also implements
//! `IntoResponse` so an administrative HTTP adapter can return it directly.

use crate::models::state::StateType;

#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition { from: StateType, to: StateType },

    #[error("Execution is not queued: {0}")]
    NotQueued(String),

    #[error("Trigger is already locked: {0}")]
    AlreadyLocked(String),

    #[error("Trigger is not locked: {0}")]
    NotLocked(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How an error is surfaced to an administrative caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminStatus {
    NotFound,
    Conflict,
    BadRequest,
    Internal,
}

impl OrchestrationError {
    /// Classify the error for an administrative response.
    ///
    /// Unlocking an already-unlocked trigger is a conflict, as is losing a
    /// lock race or an optimistic version check.
    pub fn status(&self) -> AdminStatus {
        match self {
            Self::NotFound(_) => AdminStatus::NotFound,
            Self::NotLocked(_) | Self::AlreadyLocked(_) | Self::Conflict(_) => {
                AdminStatus::Conflict
            }
            Self::IllegalArgument(_) | Self::IllegalTransition { .. } | Self::NotQueued(_) => {
                AdminStatus::BadRequest
            }
            Self::Database(_) | Self::Internal(_) => AdminStatus::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for OrchestrationError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self.status() {
            AdminStatus::NotFound => StatusCode::NOT_FOUND,
            AdminStatus::Conflict => StatusCode::CONFLICT,
            AdminStatus::BadRequest => StatusCode::BAD_REQUEST,
            AdminStatus::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_locked_surfaces_as_conflict() {
        let err = OrchestrationError::NotLocked("t1".to_string());
        assert_eq!(err.status(), AdminStatus::Conflict);
        assert_eq!(err.to_string(), "Trigger is not locked: t1");
    }

    #[test]
    fn test_illegal_transition_message() {
        let err = OrchestrationError::IllegalTransition {
            from: StateType::Success,
            to: StateType::Running,
        };
        assert_eq!(err.to_string(), "Illegal transition from SUCCESS to RUNNING");
        assert_eq!(err.status(), AdminStatus::BadRequest);
    }
}
