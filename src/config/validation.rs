//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacity, window, ttl > 0)
//! - Check the role hierarchy and that the minimum role is part of it
//! - Check that shared backends have somewhere to connect
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::http::HeaderName;

use crate::config::schema::{BackendKind, GatewayConfig};
use crate::security::access_control::normalize_role;

/// A single semantic problem, tagged with the offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }
    if config.timeouts.request_secs == Some(0) {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }
    if config.security.max_body_size == 0 {
        errors.push(ValidationError::new("security.max_body_size", "must be greater than 0"));
    }

    validate_authorization(config, &mut errors);
    validate_rate_limit(config, &mut errors);
    validate_idempotency(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("invalid socket address {value:?}")));
    }
}

fn validate_authorization(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    let authz = &config.authorization;
    if authz.role_hierarchy.is_empty() {
        errors.push(ValidationError::new("authorization.role_hierarchy", "must not be empty"));
    }

    let mut seen = HashSet::new();
    for role in authz.role_hierarchy.iter().map(|r| normalize_role(r)) {
        if role.is_empty() {
            errors.push(ValidationError::new("authorization.role_hierarchy", "contains an empty role"));
        } else if !seen.insert(role.clone()) {
            errors.push(ValidationError::new(
                "authorization.role_hierarchy",
                format!("duplicate role {role}"),
            ));
        }
    }

    let minimum = normalize_role(&authz.minimum_role);
    if !seen.contains(&minimum) {
        errors.push(ValidationError::new(
            "authorization.minimum_role",
            format!("{minimum:?} is not in the role hierarchy"),
        ));
    }
}

fn validate_rate_limit(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    let rl = &config.rate_limit;
    if rl.capacity == 0 {
        errors.push(ValidationError::new("rate_limit.capacity", "must be greater than 0"));
    }
    if rl.window_ms == 0 {
        errors.push(ValidationError::new("rate_limit.window_ms", "must be greater than 0"));
    }
    if rl.enabled && rl.backend == BackendKind::Redis && rl.redis_url.is_none() {
        errors.push(ValidationError::new("rate_limit.redis_url", "required for the redis backend"));
    }
}

fn validate_idempotency(config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
    let idem = &config.idempotency;
    if idem.ttl_ms == 0 {
        errors.push(ValidationError::new("idempotency.ttl_ms", "must be greater than 0"));
    }
    if idem.header_names.is_empty() {
        errors.push(ValidationError::new("idempotency.header_names", "at least one header is required"));
    }
    for name in &idem.header_names {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(ValidationError::new(
                "idempotency.header_names",
                format!("invalid header name {name:?}"),
            ));
        }
    }
    if idem.max_body_bytes == 0 {
        errors.push(ValidationError::new("idempotency.max_body_bytes", "must be greater than 0"));
    }
    if idem.enabled && idem.backend == BackendKind::Redis && idem.redis_url.is_none() {
        errors.push(ValidationError::new("idempotency.redis_url", "required for the redis backend"));
    }
}
