//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::links::LinkError;
use crate::sessions::EnforceError;
use crate::slots::SwitchError;
use crate::storage::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Switch(#[from] SwitchError),

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(_) => Self::NotFound("not found".to_string()),
            other => Self::Database(other),
        }
    }
}

impl From<EnforceError> for ApiError {
    fn from(e: EnforceError) -> Self {
        match e {
            EnforceError::Database(e) => e.into(),
        }
    }
}

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Switch(SwitchError::SlotPromotionTimeout { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Switch(_) | Self::Database(_) | Self::Link(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}
