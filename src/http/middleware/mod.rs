//! Request pipeline stages.
//!
//! # Data Flow
//! ```text
//! context.rs        ids, span, ambient scope, correlation headers
//!     → access_control.rs   tenant + role guard (400/401/403)
//!     → rate_limit.rs       token bucket per key (429)
//!     → idempotency.rs      replay or record mutating requests
//!     → handler
//! ```
//!
//! Stages after `context` are route layers on `/v1`, so they see matched
//! path parameters.

pub mod access_control;
pub mod context;
pub mod idempotency;
pub mod rate_limit;

pub use access_control::{authorization_middleware, AuthzState};
pub use context::context_middleware;
pub use idempotency::{idempotency_middleware, IdempotencyState, ScopeResolver};
pub use rate_limit::{rate_limit_middleware, KeyGenerator, RateLimitState};
