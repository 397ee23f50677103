//! Per-request orchestration: correlation, CORS short-circuit, the
//! authentication gate, routing, dispatch, and envelope shaping.
//!
//! Error ordering is deliberate: authentication is evaluated before route
//! existence, using the fail-closed default for unknown paths, so an
//! anonymous caller probing a protected-looking path gets 401 rather than
//! learning whether it exists.

use crate::auth::{parse_bearer, AuthError, TokenValidator};
use crate::context::correlation_id;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::routes::RouteTable;
use crate::tracker::ActivityTracker;
use futures::FutureExt;
use pf_common::{
    ErrorCode, GatewayRequest, GatewayResponse, HandlerResponse, Identity, CORRELATION_HEADER,
};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub service_name: String,
    /// Attach log-only error detail to 500 envelopes. Development only;
    /// production responses never carry internal error text.
    pub include_error_details: bool,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            service_name: "pf-gateway".to_string(),
            include_error_details: false,
        }
    }
}

/// The request pipeline, constructed once per process and shared.
pub struct Gateway {
    table: RouteTable,
    validator: Arc<TokenValidator>,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<ActivityTracker>,
    options: GatewayOptions,
}

impl Gateway {
    pub fn new(
        table: RouteTable,
        validator: Arc<TokenValidator>,
        dispatcher: Arc<Dispatcher>,
        tracker: Arc<ActivityTracker>,
        options: GatewayOptions,
    ) -> Self {
        info!(
            service = %options.service_name,
            dev_mode = options.include_error_details,
            "Gateway pipeline initialized"
        );
        Self {
            table,
            validator,
            dispatcher,
            tracker,
            options,
        }
    }

    /// Run one request through the pipeline. Never panics outward; the
    /// outermost boundary converts anything uncaught into a generic 500.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        let cid = correlation_id(&request);
        let span = tracing::info_span!(
            "request",
            method = %request.method,
            path = %request.path,
            correlation_id = %cid,
        );

        let outcome = std::panic::AssertUnwindSafe(self.process(&request, &cid).instrument(span))
            .catch_unwind()
            .await;

        match outcome {
            Ok(response) => response,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(correlation_id = %cid, detail = %detail, "Request pipeline panicked");
                GatewayResponse::error(
                    ErrorCode::InternalServerError,
                    "Internal server error",
                    &cid,
                    self.detail(&detail),
                )
            }
        }
    }

    async fn process(&self, request: &GatewayRequest, cid: &str) -> GatewayResponse {
        // CORS preflight: always public, never dispatched
        if request.method.eq_ignore_ascii_case("OPTIONS") {
            return preflight_response(cid);
        }

        let is_public = self.table.is_route_public(&request.method, &request.path);
        let identity = match self.authenticate(request, is_public, cid).await {
            Ok(identity) => identity,
            Err(response) => return *response,
        };

        // The auth gate ran first, so disclosing method and path here is
        // safe even for unmatched routes.
        let Some(route) = self.table.route_request(&request.method, &request.path) else {
            info!(correlation_id = %cid, "No route matched");
            return GatewayResponse::error(
                ErrorCode::NotFound,
                format!("No route for {} {}", request.method.to_ascii_uppercase(), request.path),
                cid,
                None,
            );
        };

        let result = self
            .dispatcher
            .dispatch(route, &self.table, request, cid, identity.as_ref())
            .await;

        // Detached telemetry: must never delay or fail the response
        if let Some(identity) = &identity {
            let tracker = Arc::clone(&self.tracker);
            let subject = identity.subject.clone();
            tokio::spawn(async move {
                tracker.record(&subject).await;
            });
        }

        match result {
            Ok(handler_response) => success_response(handler_response, cid),
            Err(e @ (DispatchError::Execution(_, _) | DispatchError::InvalidResponse(_, _))) => {
                GatewayResponse::error(
                    ErrorCode::LambdaExecutionError,
                    "Internal server error",
                    cid,
                    self.detail(&e.to_string()),
                )
            }
            Err(e) => GatewayResponse::error(
                ErrorCode::InternalServerError,
                "Internal server error",
                cid,
                self.detail(&e.to_string()),
            ),
        }
    }

    /// The authentication gate. Auth-required routes fail closed on any
    /// token problem; public routes accept an invalid token as anonymous
    /// but forward a valid identity for personalization.
    async fn authenticate(
        &self,
        request: &GatewayRequest,
        is_public: bool,
        cid: &str,
    ) -> Result<Option<Identity>, Box<GatewayResponse>> {
        let header = request.header("authorization");

        if !is_public {
            let Some(header) = header else {
                warn!(correlation_id = %cid, "Missing Authorization header on protected route");
                return Err(Box::new(unauthorized(cid)));
            };
            match self.validate_header(header).await {
                Ok(identity) => Ok(Some(identity)),
                Err(e) => {
                    warn!(correlation_id = %cid, error = %e, "Token rejected");
                    Err(Box::new(unauthorized(cid)))
                }
            }
        } else if let Some(header) = header {
            match self.validate_header(header).await {
                Ok(identity) => Ok(Some(identity)),
                Err(e) => {
                    debug!(correlation_id = %cid, error = %e, "Invalid token on public route, proceeding anonymously");
                    Ok(None)
                }
            }
        } else {
            Ok(None)
        }
    }

    async fn validate_header(&self, header: &str) -> Result<Identity, AuthError> {
        let token = parse_bearer(header)?;
        self.validator.validate(token).await
    }

    fn detail(&self, text: &str) -> Option<serde_json::Value> {
        if self.options.include_error_details {
            Some(serde_json::Value::String(text.to_string()))
        } else {
            None
        }
    }
}

/// The handler's embedded response, passed through verbatim apart from
/// the guaranteed correlation id header.
fn success_response(handler: HandlerResponse, cid: &str) -> GatewayResponse {
    let mut response = GatewayResponse {
        status: handler.status_code,
        headers: handler.headers,
        body: handler.body.unwrap_or_default(),
    };
    response
        .headers
        .entry(CORRELATION_HEADER.to_string())
        .or_insert_with(|| cid.to_string());
    response
}

fn unauthorized(cid: &str) -> GatewayResponse {
    GatewayResponse::error(ErrorCode::Unauthorized, "Unauthorized", cid, None)
}

fn preflight_response(cid: &str) -> GatewayResponse {
    GatewayResponse::json(200, &serde_json::json!({}), cid)
        .with_header("access-control-allow-origin", "*")
        .with_header(
            "access-control-allow-methods",
            "GET,POST,PUT,DELETE,OPTIONS",
        )
        .with_header(
            "access-control-allow-headers",
            "content-type,authorization,x-correlation-id",
        )
}
