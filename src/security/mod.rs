//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (after context):
//!     → access_control.rs (resolve org/user, check membership + role)
//!     → rate_limit.rs (token bucket keyed by org/user/route)
//!         ↳ shared_bucket.rs when buckets live in Redis
//!     → Pass to idempotency + handler
//!
//! Handlers and loggers:
//!     → pii.rs (scrub payloads before echoing or persisting)
//! ```
//!
//! # Design Decisions
//! - Authorization fails closed: any missing or unknown input rejects
//! - Rate limiting fails open: a broken backend never blocks traffic
//! - No trust in client input beyond the claims the guard parses

pub mod access_control;
pub mod pii;
pub mod rate_limit;
pub mod shared_bucket;

pub use access_control::{AuthorizationPolicy, AuthzError, OrgContext, Principal, RoleHierarchy};
pub use rate_limit::{BucketPolicy, BucketStore, Decision, LocalBucketStore, RateLimiter};
pub use shared_bucket::SharedBucketStore;
