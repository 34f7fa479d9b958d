//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::security::access_control::DEFAULT_ROLE_HIERARCHY;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Request size limits.
    pub security: SecurityConfig,

    /// Tenant/role authorization.
    pub authorization: AuthorizationConfig,

    /// Token-bucket admission control.
    pub rate_limit: RateLimitConfig,

    /// Replay of mutating requests.
    pub idempotency: IdempotencyConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    /// Unset means handlers run to completion.
    pub request_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum body size in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Authorization guard configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Run the guard on `/v1` routes.
    pub enabled: bool,

    /// Lowest role admitted.
    pub minimum_role: String,

    /// Roles from least to most privileged.
    pub role_hierarchy: Vec<String>,

    /// Largest JSON body inspected for an org id field.
    pub max_body_scan_bytes: usize,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            minimum_role: "STAFF".to_string(),
            role_hierarchy: DEFAULT_ROLE_HIERARCHY.iter().map(|r| r.to_string()).collect(),
            max_body_scan_bytes: 64 * 1024,
        }
    }
}

/// Where shared state lives.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local map. Correct for a single gateway instance only.
    #[default]
    Local,
    /// Redis shared by every gateway instance.
    Redis,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    pub backend: BackendKind,

    /// Required when `backend = "redis"`.
    pub redis_url: Option<String>,

    /// Bucket capacity (burst size).
    pub capacity: u32,

    /// Time for an empty bucket to refill completely, in milliseconds.
    pub window_ms: u64,

    /// Prefix for shared bucket keys.
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Local,
            redis_url: None,
            capacity: 60,
            window_ms: 60_000,
            key_prefix: "gateway:rl:".to_string(),
        }
    }
}

/// Idempotency cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Enable response replay.
    pub enabled: bool,

    pub backend: BackendKind,

    /// Required when `backend = "redis"`.
    pub redis_url: Option<String>,

    /// How long a recorded response stays replayable, in milliseconds.
    pub ttl_ms: u64,

    /// Request headers carrying the client key, checked in order.
    pub header_names: Vec<String>,

    /// Make concurrent duplicates wait for the first execution.
    pub coalesce_in_flight: bool,

    /// Largest response body that is buffered for recording.
    pub max_body_bytes: usize,

    /// Prefix for shared record keys.
    pub key_prefix: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Local,
            redis_url: None,
            ttl_ms: 10 * 60 * 1000,
            header_names: vec!["x-idempotency-key".to_string(), "idempotency-key".to_string()],
            coalesce_in_flight: false,
            max_body_bytes: 1024 * 1024,
            key_prefix: "gateway:idem:".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.rate_limit.capacity, 60);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.idempotency.ttl_ms, 600_000);
        assert_eq!(config.authorization.role_hierarchy, ["STAFF", "MANAGER", "PARTNER", "SYSTEM_ADMIN"]);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [rate_limit]
            backend = "redis"
            redis_url = "redis://cache:6379/"
            capacity = 5

            [authorization]
            minimum_role = "MANAGER"

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.backend, BackendKind::Redis);
        assert_eq!(config.rate_limit.capacity, 5);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.authorization.minimum_role, "MANAGER");
        assert!(config.authorization.enabled);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.idempotency.backend, BackendKind::Local);
    }
}
