use crate::db::errors::DbError;
use crate::jobs::{ReconcileError, SubmitError};
use crate::metering::MeteringError;
use crate::types::JobId;
use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error as ThisError;
use utoipa::ToSchema;

#[derive(ThisError, Debug)]
pub enum Error {
    /// No account identity on the request
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Authenticated, but not allowed to call this endpoint
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Neither the free quota nor paid credits cover a job
    #[error("Insufficient credits: a job costs {cost}")]
    InsufficientCredits { cost: i64 },

    /// The job was charged but the execution channel refused it; the charge has been reversed
    #[error("Job {job_id} could not be enqueued")]
    EnqueueFailed { job_id: JobId, refunded: bool },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// JSON body of every error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Stable machine-readable code, e.g. `insufficient_credits`
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub job_id: Option<JobId>,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::EnqueueFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::Database(DbError::NotFound) => StatusCode::NOT_FOUND,
            Error::Database(_) | Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthenticated { .. } => "unauthorized",
            Error::Forbidden { .. } => "forbidden",
            Error::BadRequest { .. } => "bad_request",
            Error::NotFound { .. } | Error::Database(DbError::NotFound) => "not_found",
            Error::InsufficientCredits { .. } => "insufficient_credits",
            Error::EnqueueFailed { .. } => "enqueue_failed",
            Error::Database(_) => "db_error",
            Error::Internal { .. } | Error::Other(_) => "internal_error",
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::Forbidden { message } => message.clone(),
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::InsufficientCredits { cost } => format!("Not enough credits: a job costs {cost}"),
            Error::EnqueueFailed { refunded, .. } => {
                if *refunded {
                    "The job could not be started and your credits were returned. Please try again.".to_string()
                } else {
                    "The job could not be started. Please try again.".to_string()
                }
            }
            Error::Database(DbError::NotFound) => "Resource not found".to_string(),
            Error::Database(_) => "Database error occurred".to_string(),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl From<MeteringError> for Error {
    fn from(err: MeteringError) -> Self {
        match err {
            MeteringError::InsufficientCredits { cost, .. } => Error::InsufficientCredits { cost },
            MeteringError::AccountNotFound(id) => Error::NotFound {
                resource: "Account".to_string(),
                id,
            },
            MeteringError::InvalidAmount(amount) => Error::BadRequest {
                message: format!("Amount must be positive, got {amount}"),
            },
            MeteringError::Database(db) => Error::Database(db),
        }
    }
}

/// Malformed JSON bodies are reported as `bad_request` rather than axum's plain-text rejection
impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::BadRequest {
            message: rejection.body_text(),
        }
    }
}

impl From<SubmitError> for Error {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::InvalidRequest(message) => Error::BadRequest { message },
            SubmitError::InsufficientCredits { cost } => Error::InsufficientCredits { cost },
            SubmitError::EnqueueFailed { job_id, refunded, .. } => Error::EnqueueFailed { job_id, refunded },
            SubmitError::Metering(e) => e.into(),
            SubmitError::Database(db) => Error::Database(db),
        }
    }
}

impl From<ReconcileError> for Error {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Database(db) => Error::Database(db),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::NotFound) | Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::Database(_) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::EnqueueFailed { .. } => {
                tracing::warn!("Dispatch error: {}", self);
            }
            Error::Unauthenticated { .. } | Error::Forbidden { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::InsufficientCredits { .. } => {
                tracing::debug!("Rejected job: {}", self);
            }
        }

        let body = ErrorBody {
            error: self.code(),
            message: self.user_message(),
            job_id: match &self {
                Error::EnqueueFailed { job_id, .. } => Some(*job_id),
                _ => None,
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;

    #[test]
    fn status_and_codes() {
        let cases = [
            (Error::Unauthenticated { message: None }, StatusCode::UNAUTHORIZED, "unauthorized"),
            (
                Error::BadRequest { message: "x".to_string() },
                StatusCode::BAD_REQUEST,
                "bad_request",
            ),
            (Error::InsufficientCredits { cost: 4 }, StatusCode::PAYMENT_REQUIRED, "insufficient_credits"),
            (
                Error::EnqueueFailed {
                    job_id: JobId::nil(),
                    refunded: true,
                },
                StatusCode::BAD_GATEWAY,
                "enqueue_failed",
            ),
            (Error::Database(DbError::NotFound), StatusCode::NOT_FOUND, "not_found"),
            (
                Error::Database(DbError::Other(anyhow::anyhow!("connection reset"))),
                StatusCode::INTERNAL_SERVER_ERROR,
                "db_error",
            ),
            (
                Error::Internal {
                    operation: "x".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status_code(), status, "{err}");
            assert_eq!(err.code(), code, "{err}");
        }
    }

    #[test]
    fn submit_errors_map_to_api_errors() {
        let err: Error = SubmitError::EnqueueFailed {
            job_id: JobId::nil(),
            refunded: true,
            source: ChannelError::Full,
        }
        .into();
        assert!(matches!(err, Error::EnqueueFailed { refunded: true, .. }));

        let err: Error = SubmitError::Metering(MeteringError::InvalidAmount(-1)).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = Error::Database(DbError::Other(anyhow::anyhow!("password authentication failed for user")));
        assert!(!err.user_message().contains("password"));
    }
}
