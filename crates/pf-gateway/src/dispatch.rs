//! Synchronous forwarding to downstream compute units.
//!
//! Each route names a handler id; the registry maps ids to network
//! addresses. The dispatcher reshapes the inbound request into the
//! forwarding payload, POSTs it to the handler, and interprets the reply.
//! A handler that answers HTTP 200 with a well-formed response document is
//! authoritative, whatever status it chose to embed. Anything else is a
//! fault, classified as execution (the handler ran and broke) or transport
//! (the handler was unreachable).

use crate::context::new_request_context;
use crate::routes::{extract_path_params, RouteDef, RouteTable};
use async_trait::async_trait;
use pf_common::{
    ForwardedRequest, ForwardedUser, GatewayRequest, HandlerResponse, Identity,
    CORRELATION_HEADER,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Handler id answered inline by the gateway, never forwarded.
pub const HEALTH_HANDLER: &str = "health";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No handler registered for id '{0}'")]
    MissingHandler(String),

    /// The handler could not be reached at all.
    #[error("Handler '{0}' unreachable: {1}")]
    Transport(String, String),

    /// The handler ran but failed: non-200 transport status.
    #[error("Handler '{0}' failed with status {1}")]
    Execution(String, u16),

    /// The handler answered 200 with an unparseable document.
    #[error("Handler '{0}' returned an invalid response: {1}")]
    InvalidResponse(String, String),
}

/// Maps route handler ids to downstream addresses.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    addresses: HashMap<String, String>,
}

impl HandlerRegistry {
    pub fn new(addresses: HashMap<String, String>) -> Self {
        Self { addresses }
    }

    pub fn address(&self, handler: &str) -> Option<&str> {
        self.addresses.get(handler).map(|a| a.as_str())
    }

    /// Handler ids referenced by the table but missing from the registry.
    /// The health handler is exempt; it is answered inline.
    pub fn unresolved<'a>(&self, table: &'a RouteTable) -> Vec<&'a str> {
        let mut missing: Vec<&str> = table
            .routes()
            .iter()
            .map(|r| r.handler)
            .filter(|h| *h != HEALTH_HANDLER && !self.addresses.contains_key(*h))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }
}

/// Seam for the downstream transport, mocked in tests.
#[async_trait]
pub trait HandlerInvoker: Send + Sync {
    async fn invoke(
        &self,
        handler: &str,
        address: &str,
        payload: &ForwardedRequest,
    ) -> Result<HandlerResponse, DispatchError>;
}

/// HTTP transport: POST the payload, expect 200 with a response document.
pub struct HttpInvoker {
    http: reqwest::Client,
}

impl HttpInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl HandlerInvoker for HttpInvoker {
    async fn invoke(
        &self,
        handler: &str,
        address: &str,
        payload: &ForwardedRequest,
    ) -> Result<HandlerResponse, DispatchError> {
        let response = self
            .http
            .post(address)
            .json(payload)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(handler.to_string(), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Execution(handler.to_string(), status.as_u16()));
        }

        response
            .json::<HandlerResponse>()
            .await
            .map_err(|e| DispatchError::InvalidResponse(handler.to_string(), e.to_string()))
    }
}

/// Builds forwarding payloads and drives the invoker.
pub struct Dispatcher {
    registry: HandlerRegistry,
    invoker: Arc<dyn HandlerInvoker>,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry, invoker: Arc<dyn HandlerInvoker>) -> Self {
        Self { registry, invoker }
    }

    /// Forward a matched request downstream and return the handler's
    /// embedded response.
    pub async fn dispatch(
        &self,
        route: &RouteDef,
        table: &RouteTable,
        request: &GatewayRequest,
        correlation_id: &str,
        identity: Option<&Identity>,
    ) -> Result<HandlerResponse, DispatchError> {
        if route.handler == HEALTH_HANDLER {
            return Ok(health_response());
        }

        let address = self
            .registry
            .address(route.handler)
            .ok_or_else(|| DispatchError::MissingHandler(route.handler.to_string()))?
            .to_string();

        let payload = build_payload(route, table, request, correlation_id, identity);

        debug!(
            handler = route.handler,
            method = %payload.method,
            path = %payload.path,
            "Dispatching to handler"
        );

        let result = self
            .invoker
            .invoke(route.handler, &address, &payload)
            .await;

        match &result {
            Err(DispatchError::Transport(handler, reason)) => {
                error!(handler = %handler, reason = %reason, "Handler unreachable");
            }
            Err(DispatchError::Execution(handler, status)) => {
                warn!(handler = %handler, status = %status, "Handler execution failed");
            }
            Err(DispatchError::InvalidResponse(handler, reason)) => {
                warn!(handler = %handler, reason = %reason, "Handler response unparseable");
            }
            _ => {}
        }

        result
    }
}

/// Reshape the inbound request into the downstream payload. Path
/// parameters are re-derived from the matched pattern, so handlers never
/// parse paths themselves.
pub fn build_payload(
    route: &RouteDef,
    table: &RouteTable,
    request: &GatewayRequest,
    correlation_id: &str,
    identity: Option<&Identity>,
) -> ForwardedRequest {
    let path = table.normalize_path(&request.path).to_string();
    let path_parameters = extract_path_params(route.pattern, &path);

    let mut headers = request.headers.clone();
    headers
        .entry(CORRELATION_HEADER.to_string())
        .or_insert_with(|| correlation_id.to_string());

    let mut request_context = new_request_context(correlation_id);
    request_context.user = identity.map(ForwardedUser::from);

    ForwardedRequest {
        method: request.method.to_ascii_uppercase(),
        path,
        path_parameters,
        query_string_parameters: request.query.clone(),
        headers,
        body: request.body.clone(),
        request_context,
    }
}

fn health_response() -> HandlerResponse {
    HandlerResponse {
        status_code: 200,
        headers: HashMap::from([(
            "content-type".to_string(),
            "application/json".to_string(),
        )]),
        body: Some(r#"{"status":"ok"}"#.to_string()),
    }
}
