//! Plateful API Gateway
//!
//! The single HTTP entry point for the Plateful platform. Every inbound
//! call is authenticated against the identity provider, matched against
//! the ordered route table, and forwarded synchronously to the handler
//! service that owns the route. Activity telemetry is written to DynamoDB
//! off the response path.
//!
//! ## Development Mode
//!
//! Set `PLATEFUL_DEV_MODE=true` to include internal error detail in 500
//! envelopes and to point the activity store at a local DynamoDB endpoint
//! via `LOCALSTACK_ENDPOINT`.

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::types::AttributeValue;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use chrono::{DateTime, Utc};
use pf_common::{ErrorCode, GatewayRequest, GatewayResponse};
use pf_config::ConfigLoader;
use pf_gateway::{
    ActivityStore, ActivityTracker, Dispatcher, Gateway, GatewayOptions, HandlerRegistry,
    HttpInvoker, NoopActivityStore, RouteTable, StoreError, TokenValidator, TrackerSettings,
    ValidatorConfig,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Request bodies above this size are truncated away rather than buffered.
const MAX_BODY_BYTES: usize = 6 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    pf_common::logging::init_logging("pf-gateway");

    info!("Starting Plateful API Gateway");

    // 1. Configuration
    let config = ConfigLoader::new().load()?;
    config.validate()?;

    // 2. Token validator
    let validator = Arc::new(TokenValidator::new(ValidatorConfig {
        issuer: config.auth.issuer.clone(),
        client_id: config.auth.client_id.clone(),
        jwks_url: config.auth.effective_jwks_url(),
        cache_ttl: Duration::from_secs(config.auth.jwks_cache_ttl_secs),
        max_fetches_per_minute: config.auth.jwks_max_requests_per_minute,
    }));

    // 3. Route table and handler registry
    let mut table = RouteTable::new(pf_gateway::default_routes());
    if !config.gateway.stage_prefix.is_empty() {
        table = table.with_stage_prefix(config.gateway.stage_prefix.clone());
    }
    let registry = HandlerRegistry::new(config.handlers.clone());
    for handler in registry.unresolved(&table) {
        warn!(
            handler = handler,
            "No address configured; routes for this handler will fail at dispatch"
        );
    }

    // 4. Dispatcher
    let invoker = Arc::new(HttpInvoker::new(Duration::from_millis(
        config.gateway.downstream_timeout_ms,
    )));
    let dispatcher = Arc::new(Dispatcher::new(registry, invoker));

    // 5. Activity tracker
    let store: Arc<dyn ActivityStore> = if config.tracker.enabled {
        let aws_config = if config.dev_mode {
            let endpoint = std::env::var("LOCALSTACK_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4566".to_string());
            info!(endpoint = %endpoint, "Configuring DynamoDB client for LocalStack");
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .endpoint_url(&endpoint)
                .load()
                .await
        } else {
            aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await
        };
        Arc::new(DynamoActivityStore {
            client: aws_sdk_dynamodb::Client::new(&aws_config),
            users_table: config.tracker.users_table.clone(),
            activity_table: config.tracker.activity_table.clone(),
        })
    } else {
        info!("Activity tracking disabled");
        Arc::new(NoopActivityStore)
    };
    let timezone = chrono::FixedOffset::east_opt(config.tracker.timezone_offset_hours * 3600)
        .ok_or_else(|| anyhow::anyhow!("timezone offset out of range"))?;
    let tracker = Arc::new(ActivityTracker::new(
        store,
        TrackerSettings {
            enabled: config.tracker.enabled,
            last_seen_interval: Duration::from_secs(config.tracker.last_seen_interval_secs),
            timezone,
        },
    ));

    // 6. Gateway pipeline
    let gateway = Arc::new(Gateway::new(
        table,
        validator,
        dispatcher,
        tracker,
        GatewayOptions {
            service_name: config.gateway.service_name.clone(),
            include_error_details: config.dev_mode,
        },
    ));

    print_startup_summary(&config);

    // 7. HTTP server
    let app = Router::new()
        .fallback(proxy)
        .with_state(gateway)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.http.host, config.http.port);
    info!(addr = %addr, "Gateway listening");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Plateful API Gateway shutdown complete");
    Ok(())
}

/// Every path and method funnels through the gateway pipeline; axum does
/// no routing of its own here.
async fn proxy(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let mut gw_request =
        GatewayRequest::new(parts.method.as_str(), parts.uri.path());
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            gw_request
                .headers
                .insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    if let Some(query) = parts.uri.query() {
        gw_request.query = parse_query(query);
    }
    match read_body(axum::body::to_bytes(body, MAX_BODY_BYTES).await) {
        Ok(body) => gw_request.body = body,
        Err(reason) => {
            // a dropped payload must never reach a handler as a body-less
            // mutation; answer the caller instead
            warn!(reason = reason, "Rejecting request body");
            let cid = pf_gateway::context::correlation_id(&gw_request);
            return into_axum_response(GatewayResponse::error(
                ErrorCode::BadRequest,
                reason,
                &cid,
                None,
            ));
        }
    }

    into_axum_response(gateway.handle(gw_request).await)
}

/// Buffer the request body, refusing anything over the size cap or not
/// valid UTF-8.
fn read_body(
    bytes: Result<axum::body::Bytes, axum::Error>,
) -> Result<Option<String>, &'static str> {
    let bytes = bytes.map_err(|_| "Request body too large")?;
    if bytes.is_empty() {
        return Ok(None);
    }
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| "Request body is not valid UTF-8")
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut query = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).unwrap_or_default().into_owned();
        let value = urlencoding::decode(value).unwrap_or_default().into_owned();
        if !key.is_empty() {
            query.insert(key, value);
        }
    }
    query
}

fn into_axum_response(response: GatewayResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn print_startup_summary(config: &pf_config::AppConfig) {
    info!("==========================================");
    info!("Plateful API Gateway");
    info!("  Issuer: {}", config.auth.issuer);
    info!("  Client: {}", config.auth.client_id);
    info!("  Handlers configured: {}", config.handlers.len());
    if config.tracker.enabled {
        info!(
            "  Activity tracking: {} / {}",
            config.tracker.users_table, config.tracker.activity_table
        );
    } else {
        info!("  Activity tracking: Disabled");
    }
    if config.dev_mode {
        info!("  Dev mode: ON (error detail exposed)");
    }
    info!("==========================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// DynamoDB-backed activity store

struct DynamoActivityStore {
    client: aws_sdk_dynamodb::Client,
    users_table: String,
    activity_table: String,
}

#[async_trait]
impl ActivityStore for DynamoActivityStore {
    async fn touch_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.users_table)
            .key("userId", AttributeValue::S(user_id.to_string()))
            .update_expression("SET lastSeenAt = :ts")
            // never resurrect a deleted profile
            .condition_expression("attribute_exists(userId)")
            .expression_attribute_values(":ts", AttributeValue::S(at.to_rfc3339()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(e))
                if e.err().is_conditional_check_failed_exception() =>
            {
                Ok(())
            }
            Err(e) => Err(StoreError::Write(e.to_string())),
        }
    }

    async fn bump_hourly_bucket(
        &self,
        user_id: &str,
        date: &str,
        hour: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.client
            .update_item()
            .table_name(&self.activity_table)
            .key("bucketId", AttributeValue::S(format!("{date}#{hour:02}")))
            .key("userId", AttributeValue::S(user_id.to_string()))
            .update_expression(
                "SET firstSeenAt = if_not_exists(firstSeenAt, :ts), lastSeenAt = :ts \
                 ADD requestCount :one",
            )
            .expression_attribute_values(":ts", AttributeValue::S(at.to_rfc3339()))
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_forwards_as_none() {
        assert_eq!(read_body(Ok(axum::body::Bytes::new())).unwrap(), None);
    }

    #[test]
    fn utf8_body_is_forwarded() {
        let bytes = axum::body::Bytes::from_static(b"{\"title\":\"pasta\"}");
        assert_eq!(
            read_body(Ok(bytes)).unwrap().as_deref(),
            Some("{\"title\":\"pasta\"}")
        );
    }

    #[test]
    fn non_utf8_body_is_rejected() {
        let bytes = axum::body::Bytes::from_static(&[0xff, 0xfe, 0x00]);
        assert_eq!(
            read_body(Ok(bytes)).unwrap_err(),
            "Request body is not valid UTF-8"
        );
    }

    #[test]
    fn oversized_body_is_rejected() {
        let err = axum::Error::new("length limit exceeded");
        assert_eq!(read_body(Err(err)).unwrap_err(), "Request body too large");
    }

    #[test]
    fn query_parsing_decodes_pairs() {
        let query = parse_query("tag=low%20carb&page=2&flag");
        assert_eq!(query.get("tag").unwrap(), "low carb");
        assert_eq!(query.get("page").unwrap(), "2");
        assert_eq!(query.get("flag").unwrap(), "");
    }
}
