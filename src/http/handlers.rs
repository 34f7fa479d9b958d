//! Business handlers mounted behind the pipeline.
//!
//! They read identity from the [`OrgContext`] the guard attached and
//! correlation ids from the ambient request scope.

use axum::{
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::context;
use crate::http::response::{error_response, INVALID_JSON};
use crate::security::access_control::OrgContext;
use crate::security::pii;

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn correlation() -> (Option<String>, Option<String>) {
    match context::current() {
        Some(scope) => (Some(scope.request_id), Some(scope.trace_id)),
        None => (None, None),
    }
}

/// Liveness probe outside the pipeline.
pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub timestamp: String,
}

pub async fn health() -> Json<HealthResponse> {
    let (request_id, trace_id) = correlation();
    Json(HealthResponse {
        status: "ok",
        request_id,
        trace_id,
        timestamp: now_iso(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoResponse {
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub payload: Value,
}

/// Echo the body back with PII scrubbed.
pub async fn echo(org: Option<Extension<OrgContext>>, body: Bytes) -> Response {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Map::new())
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "Echo body is not JSON");
                return error_response(StatusCode::BAD_REQUEST, INVALID_JSON);
            }
        }
    };

    let org = org.map(|Extension(org)| org);
    let (request_id, trace_id) = correlation();
    Json(EchoResponse {
        org_id: org.as_ref().map(|o| o.org_id.clone()),
        user_id: org.as_ref().map(|o| o.user_id.clone()),
        role: org.map(|o| o.role),
        request_id,
        trace_id,
        payload: pii::scrub(&payload),
    })
    .into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: String,
    pub accepted_at: String,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
}

/// Accept a job for the caller's tenant.
pub async fn create_job(org: Option<Extension<OrgContext>>) -> (StatusCode, Json<JobAccepted>) {
    let now = Utc::now();
    let org_id = org.as_ref().map_or("org", |Extension(o)| o.org_id.as_str());
    let (request_id, trace_id) = correlation();
    tracing::info!(org_id = %org_id, "Job accepted");
    (
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: format!("{}:{}", org_id, now.timestamp_millis()),
            accepted_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            request_id,
            trace_id,
        }),
    )
}
