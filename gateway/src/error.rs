use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// The seven error kinds the core surfaces. Transports translate these into
/// transport-appropriate status codes; the core itself never picks an HTTP
/// status or a gRPC `Code`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("rate limited")]
    RateLimited,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to return to the caller. Upstream/Internal failures are
    /// logged with full detail by the caller and never echoed verbatim.
    fn public_message(&self) -> String {
        match self {
            GatewayError::Upstream(_) => "upstream request failed".to_string(),
            GatewayError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "bad-request",
            GatewayError::Unauthenticated(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::RateLimited => "rate-limited",
            GatewayError::NotFound(_) => "not-found",
            GatewayError::Upstream(_) => "upstream",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.tag(), "message": self.public_message() }));
        if matches!(status, StatusCode::TOO_MANY_REQUESTS) {
            (status, [("Retry-After", "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
