//! Structured logging configuration
//!
//! Provides configurable logging with:
//! - JSON output for production (LOG_FORMAT=json)
//! - Human-readable output for development (default)
//! - Context fields via spans (correlation_id, request_id, etc.)
//!
//! Every per-request log line carries the correlation id through the
//! request span opened by the gateway, so one external call can be traced
//! across systems. A logging failure must never surface to a caller;
//! initialization is the only place this module can fail, and even there a
//! double-init is swallowed.
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: set to "json" for JSON output, anything else for text
//! - `RUST_LOG`: standard level filter (default: info), e.g.
//!   `RUST_LOG=pf_gateway=debug,tower_http=info`

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging for the given service.
///
/// Safe to call more than once; a second initialization is ignored.
pub fn init_logging(_service_name: &str) {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if log_format.eq_ignore_ascii_case("json") {
        init_json_logging(env_filter)
    } else {
        init_text_logging(env_filter)
    };

    // A second init (tests, embedded use) is not an error worth surfacing.
    let _ = result;
}

fn init_json_logging(env_filter: EnvFilter) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(false)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init()
}

fn init_text_logging(env_filter: EnvFilter) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true),
        )
        .try_init()
}
