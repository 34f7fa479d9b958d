//! Multi-tenant request gateway.
//!
//! Every `/v1` request passes through the same pipeline:
//!
//! ```text
//! context (ids, span, ambient scope)
//!     → authorization guard (tenant, user, role)
//!     → rate limiter (token bucket, local or Redis)
//!     → idempotency cache (replay or record)
//!     → handler (reads identity from context, scrubs PII)
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod context;
pub mod http;
pub mod idempotency;
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::schema::GatewayConfig;
pub use http::{HttpServer, Pipeline};
pub use lifecycle::Shutdown;
