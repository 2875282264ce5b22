pub mod jwt;
pub mod middleware;
pub mod ratelimit;
pub mod ticket;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::store::StoreError;

/// Why a request or socket upgrade was not admitted.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid or expired WebSocket ticket")]
    InvalidTicket,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("token has been revoked")]
    Revoked,
    #[error("bearer tokens are not accepted in the query string")]
    TokenInQuery,
    #[error("unknown user")]
    UnknownUser,
    #[error("credential store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::TokenInQuery => StatusCode::BAD_REQUEST,
            AdmissionError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
