//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, layer order)
//!     → middleware/ (context → authz → rate limit → idempotency)
//!     → handlers.rs (business endpoints)
//!     → response.rs (JSON error bodies)
//!     → Send to client
//! ```

pub mod handlers;
pub mod middleware;
pub mod response;
pub mod server;

pub use server::{HttpServer, Pipeline};
