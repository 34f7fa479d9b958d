//! Idempotency subsystem.
//!
//! # Data Flow
//! ```text
//! Mutating request with an idempotency key (after authz + rate limit):
//!     → cache.rs composes `scope:key` and looks it up in store.rs
//!     → hit: replay recorded status + body, handler skipped
//!     → miss: run handler, buffer response, record it with a TTL
//! ```
//!
//! # Design Decisions
//! - Best effort: store failures never block a response
//! - Concurrent duplicates are not coalesced unless explicitly enabled
//! - Records are replaced wholesale; expired records read as absent

pub mod cache;
pub mod record;
pub mod store;

pub use cache::{CachedResponse, IdempotencyCache, Intercepted};
pub use record::{composite_key, IdempotencyRecord, GLOBAL_SCOPE};
pub use store::{IdempotencyStore, MemoryIdempotencyStore, RedisIdempotencyStore};
