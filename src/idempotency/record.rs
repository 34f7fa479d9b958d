//! Recorded responses.

use serde::{Deserialize, Serialize};

/// Scope used before the tenant is known.
pub const GLOBAL_SCOPE: &str = "global";

/// Key under which a response is stored: `scope:clientKey`.
pub fn composite_key(scope: &str, client_key: &str) -> String {
    format!("{scope}:{client_key}")
}

/// A response recorded for replay. Replaced wholesale, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub expires_at_ms: u64,
}

impl IdempotencyRecord {
    /// Past its expiry the record counts as absent.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    pub fn ttl_remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms.saturating_sub(now_ms)
    }
}
