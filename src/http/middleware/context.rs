//! Request context middleware.
//!
//! # Responsibilities
//! - Resolve request and trace ids from inbound headers or generate them
//! - Open the request span and install the ambient [`RequestScope`]
//! - Echo correlation ids on every response, including rejections
//! - Record request count and latency
//!
//! [`RequestScope`]: crate::context::RequestScope

use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use crate::context::ids::{generate_id, non_empty};
use crate::context::{RequestScope, ScopeHandle};
use crate::observability::metrics;
use crate::observability::tracing::{trace_id_from_traceparent, TRACEPARENT};

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_CORRELATION_ID: &str = "x-correlation-id";
pub const X_TRACE_ID: &str = "x-trace-id";

/// Identifiers chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIds {
    pub request_id: String,
    pub trace_id: String,
    /// Echo `x-correlation-id`: the caller sent a request id but no trace id.
    pub echo_correlation: bool,
}

pub(crate) fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(non_empty)
}

pub fn resolve_ids(headers: &HeaderMap) -> ResolvedIds {
    let inbound_request_id =
        header_value(headers, X_REQUEST_ID).or_else(|| header_value(headers, X_CORRELATION_ID));
    let inbound_trace_id = header_value(headers, X_TRACE_ID);

    let trace_id = inbound_trace_id
        .or_else(|| {
            headers
                .get(TRACEPARENT)
                .and_then(|v| v.to_str().ok())
                .and_then(trace_id_from_traceparent)
        })
        .map(str::to_string)
        .unwrap_or_else(generate_id);

    ResolvedIds {
        request_id: inbound_request_id.map(str::to_string).unwrap_or_else(generate_id),
        trace_id,
        echo_correlation: inbound_request_id.is_some() && inbound_trace_id.is_none(),
    }
}

/// Outermost pipeline stage. Everything downstream runs inside the scope.
pub async fn context_middleware(mut req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let ids = resolve_ids(req.headers());

    let span = tracing::info_span!(
        "request",
        request_id = %ids.request_id,
        trace_id = %ids.trace_id,
        method = %method,
        path = %req.uri().path(),
        org_id = tracing::field::Empty,
        user_id = tracing::field::Empty,
    );

    let handle = ScopeHandle::new(RequestScope::new(&ids.request_id, &ids.trace_id));
    req.extensions_mut().insert(handle.clone());

    let mut response = handle
        .clone()
        .enter(next.run(req))
        .instrument(span.clone())
        .await;

    write_correlation_headers(response.headers_mut(), &ids);
    response.extensions_mut().insert(handle);

    let status = response.status();
    span.in_scope(|| tracing::debug!(status = status.as_u16(), "Request completed"));
    metrics::record_request(method.as_str(), status.as_u16(), start);
    response
}

fn write_correlation_headers(headers: &mut HeaderMap, ids: &ResolvedIds) {
    let Ok(request_id) = HeaderValue::from_str(&ids.request_id) else {
        return;
    };
    if ids.echo_correlation {
        headers.insert(X_CORRELATION_ID, request_id.clone());
    }
    headers.insert(X_REQUEST_ID, request_id);
    if let Ok(trace_id) = HeaderValue::from_str(&ids.trace_id) {
        headers.insert(X_TRACE_ID, trace_id);
    }
}
