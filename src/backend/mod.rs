//! Shared-store plumbing.
//!
//! # Data Flow
//! ```text
//! security::shared_bucket / idempotency::store
//!     → RedisConnector::connection() (lazy connect, cloned manager)
//!     → redis round-trip
//!     → BackendError on any transport/protocol failure
//!     → caller converts to fail-open default + warn log
//! ```
//!
//! # Design Decisions
//! - Connection is established on first use so the gateway can start while
//!   the shared store is down
//! - A failed connect is not cached; the next request retries it
//! - Connects and replies are bounded by [`STORE_TIMEOUT`], so a stalled
//!   server fails open instead of holding requests

use std::time::Duration;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tokio::sync::OnceCell;

// Keep connect attempts short; callers fail open while the store is down.
const CONNECT_BACKOFF_BASE: u64 = 2;
const CONNECT_BACKOFF_FACTOR_MS: u64 = 50;
const CONNECT_RETRIES: usize = 1;

/// Upper bound for one connect attempt and for one command reply.
pub const STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Errors raised by rate-limit and idempotency backends.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unexpected backend reply: {0}")]
    Protocol(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Lazily connected, cloneable handle to a Redis deployment.
pub struct RedisConnector {
    client: redis::Client,
    timeout: Duration,
    manager: OnceCell<ConnectionManager>,
}

impl RedisConnector {
    /// Parse the URL without connecting.
    pub fn new(url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            timeout: STORE_TIMEOUT,
            manager: OnceCell::new(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_exponent_base(CONNECT_BACKOFF_BASE)
            .set_factor(CONNECT_BACKOFF_FACTOR_MS)
            .set_number_of_retries(CONNECT_RETRIES)
            .set_connection_timeout(self.timeout)
            .set_response_timeout(self.timeout)
    }

    /// Get a multiplexed connection, connecting on first call.
    pub async fn connection(&self) -> Result<ConnectionManager, BackendError> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                tracing::info!("Connecting to shared store");
                ConnectionManager::new_with_config(self.client.clone(), self.manager_config()).await
            })
            .await?;
        Ok(manager.clone())
    }
}

impl std::fmt::Debug for RedisConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnector")
            .field("timeout", &self.timeout)
            .field("connected", &self.manager.initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_malformed_url() {
        assert!(RedisConnector::new("not a url").is_err());
    }

    #[test]
    fn test_parses_without_connecting() {
        let connector = RedisConnector::new("redis://127.0.0.1:1/").unwrap();
        assert!(format!("{:?}", connector).contains("connected: false"));
    }

    #[tokio::test]
    async fn test_stalled_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold sockets without ever replying.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let connector = RedisConnector::new(&format!("redis://{addr}/"))
            .unwrap()
            .with_timeout(Duration::from_millis(100));
        let attempt = tokio::time::timeout(Duration::from_secs(3), async {
            let mut conn = connector.connection().await?;
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, BackendError>(pong)
        })
        .await;

        let result = attempt.expect("stalled store must not hang the caller");
        assert!(result.is_err());
    }
}
