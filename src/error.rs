use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Name of the partial unique index guarding active slots.
pub const ACTIVE_SLOT_INDEX: &str = "appointments_active_slot_idx";

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),

    #[error("This slot is already taken. Please choose another one.")]
    Conflict,

    #[error("{0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Database error: {0}")]
    Database(#[source] DieselError),

    #[error("Store error: {0}")]
    Store(String),
}

impl BookingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Database(_) | Self::Store(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Conflict => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Database(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Failures worth one more attempt: a dropped connection or a lost
    /// serializable transaction.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(DieselError::DatabaseError(
                DatabaseErrorKind::ClosedConnection
                    | DatabaseErrorKind::SerializationFailure
                    | DatabaseErrorKind::UnableToSendCommand,
                _
            )) | Self::Database(DieselError::BrokenTransactionManager)
        )
    }
}

impl From<DieselError> for BookingError {
    fn from(err: DieselError) -> Self {
        match &err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)
                if info.constraint_name() == Some(ACTIVE_SLOT_INDEX) =>
            {
                Self::Conflict
            }
            _ => Self::Database(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Database(_) | Self::Store(_) => {
                error!(err = %self, "Request failed");
                "Something went wrong. Please try again later.".to_string()
            }
            _ => self.to_string(),
        };
        let body = ErrorBody {
            error: message,
            code: self.code().into(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
