//! Rate limiting middleware.
//!
//! Runs after the authorization guard, so the default key sees the resolved
//! tenant and user rather than whatever the client claimed.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::http::middleware::access_control::{X_ORG_ID, X_USER_ID};
use crate::http::middleware::context::header_value;
use crate::http::response;
use crate::observability::metrics;
use crate::security::access_control::OrgContext;
use crate::security::rate_limit::RateLimiter;

/// Maps a request to its bucket key.
pub type KeyGenerator = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

/// `{org|global}:{user|anonymous}:{METHOD}:{path}`.
pub fn default_key(req: &Request<Body>) -> String {
    let org = req.extensions().get::<OrgContext>();
    let org_id = org
        .map(|o| o.org_id.as_str())
        .or_else(|| header_value(req.headers(), X_ORG_ID))
        .unwrap_or("global");
    let user_id = org
        .map(|o| o.user_id.as_str())
        .or_else(|| header_value(req.headers(), X_USER_ID))
        .unwrap_or("anonymous");
    format!("{}:{}:{}:{}", org_id, user_id, req.method(), req.uri().path())
}

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub key_generator: KeyGenerator,
}

impl RateLimitState {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            key_generator: Arc::new(default_key),
        }
    }
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let key = (state.key_generator)(&req);
    let decision = state.limiter.consume(&key).await;

    if decision.allowed {
        return next.run(req).await;
    }

    metrics::record_rate_limited();
    let retry_after_secs = decision.retry_after_secs().unwrap_or(1).max(1);
    tracing::info!(
        key = %key,
        retry_after_ms = decision.retry_after_ms,
        "Rate limit exceeded"
    );
    response::rate_limited(retry_after_secs)
}
