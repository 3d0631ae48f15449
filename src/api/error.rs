//! Error to HTTP response mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::StorefrontError;

const BACKORDER_MESSAGE: &str = "Some items are no longer in stock right now. Continue again to place this as a \
                                 made-to-order purchase (2-3 business weeks).";

impl StorefrontError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ProductNotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::BackorderConfirmationRequired { .. } => StatusCode::CONFLICT,
            Self::PaymentError(_) | Self::CmsError(_) => StatusCode::BAD_GATEWAY,
            Self::StorageError(_) | Self::Serialization(_) | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StorefrontError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::BackorderConfirmationRequired { backorder } => json!({
                "error": BACKORDER_MESSAGE,
                "requiresBackorderConfirmation": true,
                "backorderBySlug": backorder,
            }),
            other if status.is_server_error() => {
                tracing::error!(error = %other, status = status.as_u16(), "Request failed");
                json!({ "error": other.to_string() })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
