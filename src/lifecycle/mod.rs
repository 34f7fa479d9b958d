//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → every ShutdownSignal resolves → server stops accepting
//!     → sweeper and reload tasks exit → in-flight requests drain
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//! ```
//!
//! # Design Decisions
//! - One latched watch channel; listeners created after the trigger still stop
//! - In-flight requests finish; idempotency writes are never cut short

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
