//! Replay of recorded responses for repeated idempotency keys.

use std::future::Future;
use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::watch;
use tracing::Instrument;

use crate::clock::{Clock, SystemClock};
use crate::context;
use crate::idempotency::record::{composite_key, IdempotencyRecord};
use crate::idempotency::store::IdempotencyStore;
use crate::observability::metrics;

/// A fully buffered handler response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    fn content_type(&self) -> Option<String> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn from_record(record: IdempotencyRecord) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(value) = record
            .content_type
            .as_deref()
            .and_then(|ct| HeaderValue::from_str(ct).ok())
        {
            headers.insert(header::CONTENT_TYPE, value);
        }
        let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::OK);
        Self::new(status, headers, record.body)
    }

    fn to_record(&self, expires_at_ms: u64) -> IdempotencyRecord {
        IdempotencyRecord {
            status: self.status.as_u16(),
            content_type: self.content_type(),
            body: self.body.to_vec(),
            expires_at_ms,
        }
    }

    /// Server errors are left unrecorded so a retry can still succeed.
    fn is_recordable(&self) -> bool {
        !self.status.is_server_error()
    }
}

/// Result of [`IdempotencyCache::intercept`].
#[derive(Debug, Clone)]
pub struct Intercepted {
    pub response: CachedResponse,
    /// True when the handler did not run for this request.
    pub replayed: bool,
}

/// Published by the execution that owns a key; `None` until it finishes.
type InFlight = watch::Receiver<Option<CachedResponse>>;

/// Outcome of registering interest in a key under coalescing.
enum Claim {
    Owner(watch::Sender<Option<CachedResponse>>),
    Waiter(InFlight),
}

/// Writes finished responses to the store.
#[derive(Clone)]
struct Recorder {
    store: Arc<dyn IdempotencyStore>,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl Recorder {
    async fn lookup(&self, key: &str) -> Option<IdempotencyRecord> {
        match self.store.get(key, self.clock.now_ms()).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Idempotency lookup failed, treating as miss");
                metrics::record_fail_open("idempotency");
                None
            }
        }
    }

    async fn record(&self, key: &str, response: &CachedResponse) {
        if !response.is_recordable() {
            return;
        }
        let now_ms = self.clock.now_ms();
        let record = response.to_record(now_ms + self.ttl_ms);
        if let Err(e) = self.store.put(key, record, now_ms).await {
            tracing::warn!(key = %key, error = %e, "Failed to record idempotent response");
            metrics::record_fail_open("idempotency");
        }
    }
}

/// Records handler responses and replays them for repeated keys.
///
/// Without coalescing, duplicates that arrive while the first execution is
/// still running each invoke the handler; only completed responses are
/// replayed. With coalescing on, such duplicates wait for the running
/// execution and share its response.
///
/// A keyed execution runs on its own task together with its record write,
/// so dropping the [`IdempotencyCache::intercept`] future (a disconnected
/// caller) neither cancels the handler nor loses the record.
pub struct IdempotencyCache {
    recorder: Recorder,
    coalesce_in_flight: bool,
    in_flight: Arc<DashMap<String, InFlight>>,
}

impl IdempotencyCache {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl_ms: u64) -> Self {
        Self::with_clock(store, ttl_ms, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn IdempotencyStore>, ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            recorder: Recorder { store, ttl_ms, clock },
            coalesce_in_flight: false,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Make concurrent duplicates share one execution.
    pub fn coalescing(mut self, enabled: bool) -> Self {
        self.coalesce_in_flight = enabled;
        self
    }

    pub fn ttl_ms(&self) -> u64 {
        self.recorder.ttl_ms
    }

    /// Run `handler` unless a live response is recorded for
    /// `scope:client_key`; record what it produces.
    ///
    /// With no client key the cache is bypassed. Store failures degrade to a
    /// miss (lookup) or a no-op (record).
    pub async fn intercept<F, Fut>(&self, scope: &str, client_key: Option<&str>, handler: F) -> Intercepted
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachedResponse> + Send + 'static,
    {
        let Some(client_key) = client_key else {
            return Intercepted {
                response: handler().await,
                replayed: false,
            };
        };
        let key = composite_key(scope, client_key);

        if let Some(record) = self.recorder.lookup(&key).await {
            tracing::debug!(key = %key, status = record.status, "Replaying recorded response");
            metrics::record_idempotent_replay();
            return Intercepted {
                response: CachedResponse::from_record(record),
                replayed: true,
            };
        }

        if self.coalesce_in_flight {
            match self.claim(&key) {
                Claim::Waiter(mut running) => {
                    if let Some(response) = wait_for_response(&mut running).await {
                        tracing::debug!(key = %key, "Shared response of in-flight duplicate");
                        metrics::record_idempotent_replay();
                        return Intercepted {
                            response,
                            replayed: true,
                        };
                    }
                    // Owner died without a response; run our own.
                    self.in_flight
                        .remove_if(&key, |_, current| current.has_changed().is_err());
                }
                Claim::Owner(publish) => {
                    return Intercepted {
                        response: self.execute(key, handler(), Some(publish)).await,
                        replayed: false,
                    };
                }
            }
        }

        Intercepted {
            response: self.execute(key, handler(), None).await,
            replayed: false,
        }
    }

    /// Subscribe to the running execution for `key`, or become its owner.
    fn claim(&self, key: &str) -> Claim {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(running) => Claim::Waiter(running.get().clone()),
            Entry::Vacant(slot) => {
                let (publish, running) = watch::channel(None);
                slot.insert(running);
                Claim::Owner(publish)
            }
        }
    }

    /// Run the handler and its record write on a detached task, then wait
    /// for it.
    async fn execute<Fut>(
        &self,
        key: String,
        handler: Fut,
        publish: Option<watch::Sender<Option<CachedResponse>>>,
    ) -> CachedResponse
    where
        Fut: Future<Output = CachedResponse> + Send + 'static,
    {
        let recorder = self.recorder.clone();
        let in_flight = self.in_flight.clone();
        let task_key = key.clone();
        let task = tokio::spawn(
            context::propagate(async move {
                let key = task_key;
                let response = handler.await;
                recorder.record(&key, &response).await;
                if let Some(publish) = publish {
                    let own = publish.subscribe();
                    publish.send_replace(Some(response.clone()));
                    in_flight.remove_if(&key, |_, current| current.same_channel(&own));
                }
                response
            })
            .in_current_span(),
        );

        match task.await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Idempotent handler task failed");
                self.in_flight
                    .remove_if(&key, |_, current| current.has_changed().is_err());
                failed_execution()
            }
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.recorder.store.purge_expired(self.recorder.clock.now_ms())
    }
}

/// `None` when the owning execution ended without publishing.
async fn wait_for_response(running: &mut InFlight) -> Option<CachedResponse> {
    running
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|published| published.clone())
}

fn failed_execution() -> CachedResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    CachedResponse::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        headers,
        r#"{"error":"internal_error"}"#,
    )
}
