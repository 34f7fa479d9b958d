//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use tenant_gateway::backend::BackendError;
use tenant_gateway::clock::ManualClock;
use tenant_gateway::idempotency::{IdempotencyCache, IdempotencyRecord, IdempotencyStore, MemoryIdempotencyStore};
use tenant_gateway::security::rate_limit::{BucketPolicy, BucketStore, Decision, LocalBucketStore, RateLimiter};
use tenant_gateway::{GatewayConfig, Pipeline};

pub const START_MS: u64 = 1_700_000_000_000;

/// Defaults, minus the metrics listener.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.observability.metrics_enabled = false;
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config
}

/// Pipeline with in-memory stores driven by `clock`.
pub fn pipeline_with_clock(config: GatewayConfig, clock: &ManualClock) -> Pipeline {
    pipeline_with_stores(
        config,
        clock,
        Arc::new(LocalBucketStore::new()),
        Arc::new(MemoryIdempotencyStore::new()),
    )
}

pub fn pipeline_with_stores(
    config: GatewayConfig,
    clock: &ManualClock,
    buckets: Arc<dyn BucketStore>,
    records: Arc<dyn IdempotencyStore>,
) -> Pipeline {
    let clock = Arc::new(clock.clone());
    let limiter = Arc::new(RateLimiter::with_clock(
        buckets,
        BucketPolicy::new(config.rate_limit.capacity, config.rate_limit.window_ms),
        clock.clone(),
    ));
    let cache = Arc::new(
        IdempotencyCache::with_clock(records, config.idempotency.ttl_ms, clock)
            .coalescing(config.idempotency.coalesce_in_flight),
    );
    Pipeline::with_components(config, limiter, cache)
}

pub fn is_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

/// Request carrying a full tenant identity.
pub fn member_request(method: Method, uri: &str, org: &str, user: &str, memberships: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-org-id", org)
        .header("x-user-id", user)
        .header("x-org-memberships", memberships)
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    TestResponse { status, headers, body }
}

/// Bucket store whose backend is always down.
pub struct FailingBucketStore;

#[async_trait]
impl BucketStore for FailingBucketStore {
    async fn consume(&self, _: &str, _: &BucketPolicy, _: u64) -> Result<Decision, BackendError> {
        Err(BackendError::Unavailable("injected failure".into()))
    }
}

/// Idempotency store whose backend is always down.
pub struct FailingIdempotencyStore;

#[async_trait]
impl IdempotencyStore for FailingIdempotencyStore {
    async fn get(&self, _: &str, _: u64) -> Result<Option<IdempotencyRecord>, BackendError> {
        Err(BackendError::Unavailable("injected failure".into()))
    }

    async fn put(&self, _: &str, _: IdempotencyRecord, _: u64) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("injected failure".into()))
    }
}
