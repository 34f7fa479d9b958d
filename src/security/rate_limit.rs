//! Token-bucket admission control.
//!
//! # Responsibilities
//! - Refill and debit buckets keyed by an opaque string
//! - Hide the storage backend (process-local or shared) behind one trait
//! - Fail open when the backend cannot answer
//!
//! # Design Decisions
//! - Bucket arithmetic is a pure function so every backend applies the same
//!   rule; the shared backend mirrors it in a server-side script
//! - Time is epoch milliseconds supplied by the caller
//! - State expires one window after its last write; an absent bucket is full

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::backend::BackendError;
use crate::clock::{Clock, SystemClock};
use crate::observability::metrics;

/// Capacity and refill window of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    pub capacity: f64,
    pub window_ms: u64,
}

impl BucketPolicy {
    pub fn new(capacity: u32, window_ms: u64) -> Self {
        Self {
            capacity: capacity as f64,
            window_ms,
        }
    }

    /// Tokens added per millisecond.
    pub fn refill_rate(&self) -> f64 {
        self.capacity / self.window_ms as f64
    }

    /// Tokens added over `elapsed_ms`.
    pub fn refill_for(&self, elapsed_ms: u64) -> f64 {
        elapsed_ms as f64 * self.capacity / self.window_ms as f64
    }
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

impl TokenBucket {
    /// A bucket that has never been used.
    pub fn full(policy: &BucketPolicy, now_ms: u64) -> Self {
        Self {
            tokens: policy.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Refill for elapsed time, then try to take one token.
    ///
    /// Returns the state to persist and the admission decision. A clock that
    /// has not moved forward never refills and never rewinds `last_refill_ms`.
    pub fn try_acquire(self, policy: &BucketPolicy, now_ms: u64) -> (TokenBucket, Decision) {
        let mut bucket = self;
        if now_ms > bucket.last_refill_ms {
            let refill = policy.refill_for(now_ms - bucket.last_refill_ms);
            bucket.tokens = (bucket.tokens + refill).min(policy.capacity);
            bucket.last_refill_ms = now_ms;
        }

        if bucket.tokens < 1.0 {
            return (bucket, Decision::rejected(bucket.ms_until_token(policy)));
        }

        bucket.tokens -= 1.0;
        (bucket, Decision::allowed())
    }

    /// Smallest wait after which at least one whole token is available.
    fn ms_until_token(&self, policy: &BucketPolicy) -> u64 {
        let deficit = 1.0 - self.tokens;
        let mut wait = (deficit / policy.refill_rate()).ceil().max(1.0) as u64;
        // Float rounding can leave the estimate a hair short.
        while self.tokens + policy.refill_for(wait) < 1.0 {
            wait += 1;
        }
        wait
    }
}

/// Outcome of one consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_ms: Option<u64>,
}

impl Decision {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_ms: None,
        }
    }

    pub fn rejected(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            retry_after_ms: Some(retry_after_ms),
        }
    }

    /// Whole seconds for the `Retry-After` header, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after_ms.map(|ms| ms.div_ceil(1000))
    }
}

/// Storage for bucket state. Implementations must make the
/// load-refill-debit-store sequence atomic per key.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn consume(
        &self,
        key: &str,
        policy: &BucketPolicy,
        now_ms: u64,
    ) -> Result<Decision, BackendError>;

    /// Drop state that has outlived its window. Stores with native expiry
    /// need not do anything.
    fn purge_expired(&self, _now_ms: u64) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalEntry {
    bucket: TokenBucket,
    expires_at_ms: u64,
}

/// Process-local bucket map. Correct only for a single gateway instance.
#[derive(Debug, Default)]
pub struct LocalBucketStore {
    buckets: DashMap<String, LocalEntry>,
}

impl LocalBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[async_trait]
impl BucketStore for LocalBucketStore {
    async fn consume(
        &self,
        key: &str,
        policy: &BucketPolicy,
        now_ms: u64,
    ) -> Result<Decision, BackendError> {
        // The entry guard holds the shard lock across the whole update.
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| LocalEntry {
            bucket: TokenBucket::full(policy, now_ms),
            expires_at_ms: now_ms + policy.window_ms,
        });

        let current = if entry.expires_at_ms <= now_ms {
            TokenBucket::full(policy, now_ms)
        } else {
            entry.bucket
        };

        let (bucket, decision) = current.try_acquire(policy, now_ms);
        *entry = LocalEntry {
            bucket,
            expires_at_ms: now_ms + policy.window_ms,
        };
        Ok(decision)
    }

    fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, entry| entry.expires_at_ms > now_ms);
        before - self.buckets.len()
    }
}

/// Admission controller shared by all requests of a gateway.
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    policy: ArcSwap<BucketPolicy>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>, policy: BucketPolicy) -> Self {
        Self::with_clock(store, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn BucketStore>, policy: BucketPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy: ArcSwap::from_pointee(policy),
            clock,
        }
    }

    pub fn local(policy: BucketPolicy) -> Self {
        Self::new(Arc::new(LocalBucketStore::new()), policy)
    }

    pub fn policy(&self) -> BucketPolicy {
        **self.policy.load()
    }

    /// Replace capacity/window for subsequent attempts.
    pub fn update_policy(&self, policy: BucketPolicy) {
        tracing::info!(capacity = policy.capacity, window_ms = policy.window_ms, "Rate limit policy updated");
        self.policy.store(Arc::new(policy));
    }

    /// Try to consume one token for `key` now.
    pub async fn consume(&self, key: &str) -> Decision {
        self.consume_at(key, self.clock.now_ms()).await
    }

    /// Try to consume one token for `key` at `now_ms`.
    ///
    /// Backend failures admit the request and are logged.
    pub async fn consume_at(&self, key: &str, now_ms: u64) -> Decision {
        let policy = self.policy();
        match self.store.consume(key, &policy, now_ms).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Rate limit backend failed, admitting request");
                metrics::record_fail_open("rate_limit");
                Decision::allowed()
            }
        }
    }

    /// Reclaim expired local state.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired(self.clock.now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    #[async_trait]
    impl BucketStore for FailingStore {
        async fn consume(&self, _: &str, _: &BucketPolicy, _: u64) -> Result<Decision, BackendError> {
            Err(BackendError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_two_allowed_then_rejected() {
        let limiter = RateLimiter::local(BucketPolicy::new(2, 1000));
        let t = 1_000_000;
        let d1 = limiter.consume_at("k", t).await;
        let d2 = limiter.consume_at("k", t + 3).await;
        let d3 = limiter.consume_at("k", t + 7).await;
        assert!(d1.allowed && d2.allowed);
        assert!(!d3.allowed);
        let retry = d3.retry_after_ms.unwrap();
        assert!((400..=600).contains(&retry), "retry_after_ms = {retry}");
    }

    #[tokio::test]
    async fn test_retry_after_yields_exactly_one_more() {
        let limiter = RateLimiter::local(BucketPolicy::new(2, 1000));
        let t = 5_000;
        limiter.consume_at("k", t).await;
        limiter.consume_at("k", t).await;
        let rejected = limiter.consume_at("k", t + 5).await;
        let wait = rejected.retry_after_ms.unwrap();

        let again = t + 5 + wait;
        assert!(limiter.consume_at("k", again).await.allowed);
        assert!(!limiter.consume_at("k", again).await.allowed);
    }

    #[tokio::test]
    async fn test_steady_rate_is_never_rejected() {
        for (capacity, window) in [(1u32, 100u64), (4, 1000), (10, 1000), (60, 60_000)] {
            let limiter = RateLimiter::local(BucketPolicy::new(capacity, window));
            let interval = window / capacity as u64;
            let mut t = 10_000;
            for i in 0..500 {
                let d = limiter.consume_at("steady", t).await;
                assert!(d.allowed, "C={capacity} W={window} rejected at step {i}");
                t += interval;
            }
        }
    }

    #[tokio::test]
    async fn test_faster_than_rate_is_eventually_rejected() {
        let limiter = RateLimiter::local(BucketPolicy::new(10, 1000));
        let mut t = 0;
        let mut rejected = false;
        for _ in 0..100 {
            if !limiter.consume_at("fast", t).await.allowed {
                rejected = true;
                break;
            }
            t += 50;
        }
        assert!(rejected);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::local(BucketPolicy::new(1, 1000));
        assert!(limiter.consume_at("a", 0).await.allowed);
        assert!(!limiter.consume_at("a", 1).await.allowed);
        assert!(limiter.consume_at("b", 1).await.allowed);
    }

    #[test]
    fn test_tokens_never_exceed_capacity_or_go_negative() {
        let policy = BucketPolicy::new(3, 300);
        let mut bucket = TokenBucket::full(&policy, 0);
        let mut t = 0;
        for step in 0..200u64 {
            t += (step * 37) % 250;
            let (next, _) = bucket.try_acquire(&policy, t);
            assert!(next.tokens >= 0.0 && next.tokens <= policy.capacity);
            bucket = next;
        }
    }

    #[test]
    fn test_clock_going_backwards_does_not_refill() {
        let policy = BucketPolicy::new(2, 1000);
        let bucket = TokenBucket { tokens: 0.5, last_refill_ms: 10_000 };
        let (next, decision) = bucket.try_acquire(&policy, 9_000);
        assert!(!decision.allowed);
        assert_eq!(next.last_refill_ms, 10_000);
        assert_eq!(next.tokens, 0.5);
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        assert_eq!(Decision::rejected(1).retry_after_secs(), Some(1));
        assert_eq!(Decision::rejected(1000).retry_after_secs(), Some(1));
        assert_eq!(Decision::rejected(1001).retry_after_secs(), Some(2));
        assert_eq!(Decision::allowed().retry_after_secs(), None);
    }

    #[tokio::test]
    async fn test_expired_local_state_is_reclaimed() {
        let store = LocalBucketStore::new();
        let policy = BucketPolicy::new(1, 1000);
        store.consume("old", &policy, 0).await.unwrap();
        store.consume("new", &policy, 900).await.unwrap();
        assert_eq!(store.purge_expired(1_000), 1);
        assert_eq!(store.len(), 1);
        assert!(store.consume("old", &policy, 1_000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_backend_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), BucketPolicy::new(1, 1000));
        for _ in 0..5 {
            assert_eq!(limiter.consume("k").await, Decision::allowed());
        }
    }

    #[tokio::test]
    async fn test_policy_update_applies_to_next_attempt() {
        let limiter = RateLimiter::local(BucketPolicy::new(1, 1000));
        assert!(limiter.consume_at("k", 0).await.allowed);
        assert!(!limiter.consume_at("k", 0).await.allowed);
        limiter.update_policy(BucketPolicy::new(5, 1000));
        assert_eq!(limiter.policy().capacity, 5.0);
        assert!(limiter.consume_at("fresh", 0).await.allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_never_over_admit() {
        let limiter = Arc::new(RateLimiter::local(BucketPolicy::new(10, 60_000)));
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move { limiter.consume_at("shared", 42).await.allowed }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
