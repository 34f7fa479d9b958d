//! Idempotency middleware.
//!
//! # Responsibilities
//! - Pick the client key from the configured headers
//! - Resolve the replay scope (tenant by default)
//! - Buffer the handler response so it can be recorded
//! - Mark replays with `x-idempotent-replay: true`
//!
//! # Design Decisions
//! - Only POST, PUT, PATCH and DELETE are intercepted
//! - A response too large to buffer becomes a 500 and is not recorded
//! - The handler runs on its own task, so a dropped connection still records

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::context;
use crate::context::ids::non_empty;
use crate::idempotency::{CachedResponse, IdempotencyCache, Intercepted, GLOBAL_SCOPE};
use crate::security::access_control::OrgContext;

pub const X_IDEMPOTENT_REPLAY: &str = "x-idempotent-replay";

/// Maps a request to the namespace its idempotency keys live in.
pub type ScopeResolver = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// Resolved tenant, else the tenant on the ambient scope, else `global`.
pub fn default_scope(req: &Request<Body>) -> String {
    req.extensions()
        .get::<OrgContext>()
        .map(|org| org.org_id.clone())
        .or_else(|| context::current().and_then(|scope| scope.org_id))
        .unwrap_or_else(|| GLOBAL_SCOPE.to_string())
}

#[derive(Clone)]
pub struct IdempotencyState {
    pub cache: Arc<IdempotencyCache>,
    pub header_names: Arc<[HeaderName]>,
    pub scope_resolver: ScopeResolver,
    pub max_body_bytes: usize,
}

impl IdempotencyState {
    pub fn new(cache: Arc<IdempotencyCache>, header_names: Vec<HeaderName>, max_body_bytes: usize) -> Self {
        Self {
            cache,
            header_names: header_names.into(),
            scope_resolver: Arc::new(default_scope),
            max_body_bytes,
        }
    }

    fn client_key(&self, req: &Request<Body>) -> Option<String> {
        self.header_names
            .iter()
            .filter_map(|name| req.headers().get(name))
            .filter_map(|v| v.to_str().ok())
            .find_map(non_empty)
            .map(str::to_string)
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !is_mutating(req.method()) {
        return next.run(req).await;
    }
    let Some(client_key) = state.client_key(&req) else {
        return next.run(req).await;
    };

    let scope = (state.scope_resolver)(&req);
    let max_body_bytes = state.max_body_bytes;
    let intercepted = state
        .cache
        .intercept(&scope, Some(client_key.as_str()), || async move {
            buffer_response(next.run(req).await, max_body_bytes).await
        })
        .await;

    into_response(intercepted)
}

async fn buffer_response(response: Response, limit: usize) -> CachedResponse {
    let (parts, body) = response.into_parts();
    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => CachedResponse::new(parts.status, parts.headers, bytes),
        Err(e) => {
            tracing::warn!(error = %e, limit, "Response too large to record for idempotent replay");
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            CachedResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                r#"{"error":"response_too_large"}"#,
            )
        }
    }
}

fn into_response(intercepted: Intercepted) -> Response {
    let Intercepted { response, replayed } = intercepted;
    let mut out = (response.status, response.headers, response.body).into_response();
    if replayed {
        out.headers_mut()
            .insert(X_IDEMPOTENT_REPLAY, HeaderValue::from_static("true"));
    }
    out
}
