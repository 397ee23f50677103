//! Correlation id extraction and per-request context creation.

use chrono::Utc;
use pf_common::{GatewayRequest, RequestContext};
use uuid::Uuid;

/// Headers recognized as carrying an upstream trace id, checked in order.
/// Lookup is case-insensitive (request headers are stored lowercased).
pub const CORRELATION_HEADERS: &[&str] = &["x-correlation-id", "x-request-id", "x-amzn-trace-id"];

/// Extract the correlation id from the first recognized header, or mint a
/// fresh one when no upstream id was provided.
pub fn correlation_id(request: &GatewayRequest) -> String {
    for name in CORRELATION_HEADERS {
        if let Some(value) = request.header(name) {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    Uuid::new_v4().to_string()
}

/// Build the immutable per-request context threaded through dispatch.
/// The request id is always freshly generated; the correlation id may have
/// been inherited from the caller.
pub fn new_request_context(correlation_id: &str) -> RequestContext {
    RequestContext {
        correlation_id: correlation_id.to_string(),
        user: None,
        request_id: Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
    }
}
