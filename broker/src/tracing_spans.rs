//! Pre-built [`tracing::Span`] constructors for broker operations.
//!
//! Consistent span names and fields make traces easy to filter by hash,
//! request id or worker address.

use tracing::{info_span, Span};

/// Span covering one dispatch from request to resolution or timeout.
pub fn dispatch_span(hash: &str, multiplier: u32, precache: bool) -> Span {
    info_span!("dispatch", hash = %hash, multiplier, precache)
}

/// Span covering the lifetime of one worker connection.
pub fn connection_span(id: u64, addr: &str, identity: &str) -> Span {
    info_span!("connection", id, addr = %addr, identity = %identity)
}

/// Span covering the processing of one credit event.
pub fn credit_span(hash: &str, provider: &str) -> Span {
    info_span!("credit", hash = %hash, provider = %provider)
}
