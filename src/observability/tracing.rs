//! W3C trace context.
//!
//! # Responsibilities
//! - Extract the trace id from an inbound `traceparent` header
//!
//! # Design Decisions
//! - Only version `00` is understood; anything else is ignored
//! - All-zero ids are invalid (W3C Trace Context)

/// Inbound trace context header.
pub const TRACEPARENT: &str = "traceparent";

/// Trace id (32 lowercase hex chars) from a valid `traceparent` value.
pub fn trace_id_from_traceparent(value: &str) -> Option<&str> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let parent_id = parts.next()?;
    let flags = parts.next()?;
    if parts.next().is_some() || version != "00" {
        return None;
    }
    let valid = is_hex(trace_id, 32)
        && is_hex(parent_id, 16)
        && is_hex(flags, 2)
        && trace_id.bytes().any(|b| b != b'0')
        && parent_id.bytes().any(|b| b != b'0');
    valid.then_some(trace_id)
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
