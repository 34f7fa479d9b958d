//! Error responses.
//!
//! # Responsibilities
//! - Render every gateway-generated failure as `{"error": "<code>"}`
//! - Map authorization failures to their fixed status codes
//! - Attach `Retry-After` to rate-limit rejections
//!
//! # Design Decisions
//! - Bodies carry a machine-readable code only, never internal detail
//! - Correlation ids travel in headers, added by the context middleware

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::security::access_control::AuthzError;

pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
pub const INVALID_JSON: &str = "invalid_json";

/// JSON error body with a single code.
pub fn error_response(status: StatusCode, code: &str) -> Response {
    (status, Json(json!({ "error": code }))).into_response()
}

/// 429 with the wait rounded up to whole seconds.
pub fn rate_limited(retry_after_secs: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": RATE_LIMIT_EXCEEDED,
            "retryAfterSeconds": retry_after_secs,
        })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.code())
    }
}
