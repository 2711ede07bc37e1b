use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::{DbErr, SqlErr};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error description
    pub error: String,
    /// RFC 3339 timestamp of the failure
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ValidationError(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    InvalidStatus(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InsufficientStock(String),

    #[error("{0}")]
    PaymentFailed(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Maps a store error, turning unique-constraint violations into `Conflict`.
    pub fn from_db_conflict(err: DbErr, conflict_message: &str) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                ServiceError::Conflict(conflict_message.to_string())
            }
            _ => ServiceError::DatabaseError(err),
        }
    }

    /// Stable label used to classify failures in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) | Self::InvalidInput(_) | Self::BadRequest(_) => {
                "invalid_input"
            }
            Self::InvalidStatus(_) => "state_conflict",
            Self::Conflict(_) => "conflict",
            Self::InsufficientStock(_) => "insufficient_resource",
            Self::PaymentFailed(_) => "payment",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::CacheError(_) => "cache",
            Self::SerializationError(_) => "serialization",
            Self::NotificationError(_) => "notification",
            Self::InternalError(_) => "internal",
        }
    }

    /// Whether the failure is part of the domain taxonomy rather than an unexpected fault.
    pub fn is_domain(&self) -> bool {
        !matches!(
            self,
            Self::DatabaseError(_)
                | Self::CacheError(_)
                | Self::SerializationError(_)
                | Self::NotificationError(_)
                | Self::InternalError(_)
        )
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            err if err.is_domain() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Unexpected errors return a generic message to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        if self.is_domain() {
            self.to_string()
        } else {
            "Internal server error".to_string()
        }
    }

    /// Counts the failure under `commerce_errors_total` for the given operation.
    pub fn record(&self, operation: &'static str) {
        metrics::counter!(
            "commerce_errors_total",
            1,
            "error_type" => self.kind(),
            "operation" => operation
        );
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if !self.is_domain() {
            error!(error = %self, kind = self.kind(), "Unexpected failure while handling request");
        }

        let body = ErrorResponse {
            error: self.response_message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}

// Result extensions for easier error handling
pub trait ResultExt<T> {
    /// Records the error (if any) under the given operation label and passes it through.
    fn record_err(self, operation: &'static str) -> Result<T, ServiceError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<ServiceError>,
{
    fn record_err(self, operation: &'static str) -> Result<T, ServiceError> {
        self.map_err(|e| {
            let err = e.into();
            err.record(operation);
            err
        })
    }
}
