//! Request and trace identifier generation.
//!
//! Identifiers are UUID v4 strings. The secure generator is preferred; if
//! the OS entropy source fails the id is built from a pseudo-random
//! generator instead, so identifier generation never fails a request.

use rand::rngs::OsRng;
use rand::RngCore;

/// Generate a fresh identifier.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    if let Err(e) = OsRng.try_fill_bytes(&mut bytes) {
        tracing::warn!(error = %e, "Secure random unavailable, using pseudo-random id");
        bytes = fallback_bytes();
    }
    uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
}

fn fallback_bytes() -> [u8; 16] {
    fastrand::u128(..).to_le_bytes()
}

/// Trim an inbound header value, returning `None` when nothing is left.
pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
