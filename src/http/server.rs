//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the pipeline components from config (stores, limiter, cache)
//! - Create the Axum Router with handlers and middleware in order
//! - Apply hot-reloaded policy without restarting
//! - Sweep expired local state in the background
//! - Serve until the shutdown signal, then drain

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::HeaderName,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::backend::{BackendError, RedisConnector};
use crate::config::schema::{BackendKind, GatewayConfig};
use crate::http::handlers;
use crate::http::middleware::{
    authorization_middleware, context_middleware, idempotency_middleware, rate_limit_middleware,
    AuthzState, IdempotencyState, KeyGenerator, RateLimitState, ScopeResolver,
};
use crate::idempotency::{IdempotencyCache, IdempotencyStore, MemoryIdempotencyStore, RedisIdempotencyStore};
use crate::lifecycle::ShutdownSignal;
use crate::security::access_control::{AuthorizationPolicy, RoleHierarchy};
use crate::security::rate_limit::{BucketPolicy, BucketStore, LocalBucketStore, RateLimiter};
use crate::security::shared_bucket::SharedBucketStore;

/// How often expired local buckets and records are reclaimed.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub fn authorization_policy(config: &GatewayConfig) -> AuthorizationPolicy {
    AuthorizationPolicy::new(
        &config.authorization.minimum_role,
        RoleHierarchy::new(&config.authorization.role_hierarchy),
    )
}

pub fn bucket_policy(config: &GatewayConfig) -> BucketPolicy {
    BucketPolicy::new(config.rate_limit.capacity, config.rate_limit.window_ms)
}

fn redis_connector(url: Option<&str>, section: &str) -> Result<RedisConnector, BackendError> {
    let url = url.ok_or_else(|| BackendError::Unavailable(format!("{section}.redis_url is not set")))?;
    RedisConnector::new(url)
}

/// A disabled stage never reaches its store, so it never needs Redis.
fn bucket_store(config: &GatewayConfig) -> Result<Arc<dyn BucketStore>, BackendError> {
    let rl = &config.rate_limit;
    Ok(match rl.backend {
        _ if !rl.enabled => Arc::new(LocalBucketStore::new()),
        BackendKind::Local => Arc::new(LocalBucketStore::new()),
        BackendKind::Redis => Arc::new(SharedBucketStore::new(
            redis_connector(rl.redis_url.as_deref(), "rate_limit")?,
            rl.key_prefix.clone(),
        )),
    })
}

fn idempotency_store(config: &GatewayConfig) -> Result<Arc<dyn IdempotencyStore>, BackendError> {
    let idem = &config.idempotency;
    Ok(match idem.backend {
        _ if !idem.enabled => Arc::new(MemoryIdempotencyStore::new()),
        BackendKind::Local => Arc::new(MemoryIdempotencyStore::new()),
        BackendKind::Redis => Arc::new(RedisIdempotencyStore::new(
            redis_connector(idem.redis_url.as_deref(), "idempotency")?,
            idem.key_prefix.clone(),
        )),
    })
}

/// The four middleware stages plus the settings the router needs.
#[derive(Clone)]
pub struct Pipeline {
    config: GatewayConfig,
    authz: AuthzState,
    rate_limit: RateLimitState,
    idempotency: IdempotencyState,
}

impl Pipeline {
    /// Build every component from config. Redis backends connect lazily.
    pub fn from_config(config: GatewayConfig) -> Result<Self, BackendError> {
        let limiter = Arc::new(RateLimiter::new(bucket_store(&config)?, bucket_policy(&config)));
        let cache = Arc::new(
            IdempotencyCache::new(idempotency_store(&config)?, config.idempotency.ttl_ms)
                .coalescing(config.idempotency.coalesce_in_flight),
        );
        Ok(Self::with_components(config, limiter, cache))
    }

    /// Assemble around caller-built components (custom stores or clocks).
    pub fn with_components(
        config: GatewayConfig,
        limiter: Arc<RateLimiter>,
        cache: Arc<IdempotencyCache>,
    ) -> Self {
        let header_names = config
            .idempotency
            .header_names
            .iter()
            .filter_map(|name| match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => Some(name),
                Err(e) => {
                    tracing::warn!(header = %name, error = %e, "Ignoring invalid idempotency header name");
                    None
                }
            })
            .collect();

        Self {
            authz: AuthzState::new(
                authorization_policy(&config),
                config.authorization.max_body_scan_bytes,
            ),
            rate_limit: RateLimitState::new(limiter),
            idempotency: IdempotencyState::new(cache, header_names, config.idempotency.max_body_bytes),
            config,
        }
    }

    pub fn with_key_generator(mut self, key_generator: KeyGenerator) -> Self {
        self.rate_limit.key_generator = key_generator;
        self
    }

    pub fn with_scope_resolver(mut self, scope_resolver: ScopeResolver) -> Self {
        self.idempotency.scope_resolver = scope_resolver;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limit.limiter
    }

    pub fn cache(&self) -> &Arc<IdempotencyCache> {
        &self.idempotency.cache
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// Route layers run outermost-last: the guard wraps the limiter, which
    /// wraps the idempotency cache, which wraps the handler.
    #[allow(deprecated)]
    pub fn router(&self) -> Router {
        let mut v1 = Router::new()
            .route("/health", get(handlers::health))
            .route("/echo", post(handlers::echo))
            .route("/jobs", post(handlers::create_job))
            .route("/orgs/{orgId}/jobs", post(handlers::create_job));

        if self.config.idempotency.enabled {
            v1 = v1.route_layer(from_fn_with_state(self.idempotency.clone(), idempotency_middleware));
        }
        if self.config.rate_limit.enabled {
            v1 = v1.route_layer(from_fn_with_state(self.rate_limit.clone(), rate_limit_middleware));
        }
        if self.config.authorization.enabled {
            v1 = v1.route_layer(from_fn_with_state(self.authz.clone(), authorization_middleware));
        }

        let mut router = Router::new()
            .route("/healthz", get(handlers::liveness))
            .nest("/v1", v1)
            .layer(RequestBodyLimitLayer::new(self.config.security.max_body_size));

        if let Some(secs) = self.config.timeouts.request_secs {
            router = router.layer(TimeoutLayer::new(Duration::from_secs(secs)));
        }

        router
            .layer(from_fn(context_middleware))
            .layer(TraceLayer::new_for_http())
    }

    /// Apply the reloadable parts of a new config.
    pub fn apply_config(&self, config: &GatewayConfig) {
        let policy = authorization_policy(config);
        if **self.authz.policy.load() != policy {
            self.authz.update_policy(policy);
        }

        let buckets = bucket_policy(config);
        if self.rate_limit.limiter.policy() != buckets {
            self.rate_limit.limiter.update_policy(buckets);
        }

        if config.rate_limit.backend != self.config.rate_limit.backend
            || config.idempotency.backend != self.config.idempotency.backend
            || config.listener != self.config.listener
        {
            tracing::warn!("Backend or listener changes require a restart; ignoring them");
        }
    }

    /// Drop expired local buckets and records.
    pub fn purge_expired(&self) -> (usize, usize) {
        (
            self.rate_limit.limiter.purge_expired(),
            self.idempotency.cache.purge_expired(),
        )
    }
}

/// HTTP server for the gateway.
pub struct HttpServer {
    pipeline: Pipeline,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: GatewayConfig) -> Result<Self, BackendError> {
        Ok(Self::with_pipeline(Pipeline::from_config(config)?))
    }

    pub fn with_pipeline(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        shutdown: ShutdownSignal,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let reload = {
            let pipeline = self.pipeline.clone();
            let mut stop = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        update = config_updates.recv() => match update {
                            Some(config) => pipeline.apply_config(&config),
                            None => break,
                        },
                        _ = stop.wait() => break,
                    }
                }
            })
        };

        let sweeper = {
            let pipeline = self.pipeline.clone();
            let mut stop = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let (buckets, records) = pipeline.purge_expired();
                            if buckets + records > 0 {
                                tracing::debug!(buckets, records, "Purged expired state");
                            }
                        }
                        _ = stop.wait() => break,
                    }
                }
            })
        };

        let app = self
            .pipeline
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown = shutdown;
                shutdown.wait().await;
                tracing::info!("Shutdown signal received, draining connections");
            })
            .await?;

        let _ = tokio::join!(reload, sweeper);
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
