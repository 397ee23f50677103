use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod logging;

/// Response header carrying the per-request correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

// ============================================================================
// Gateway Wire Types
// ============================================================================

/// An inbound HTTP request as seen by the gateway, decoupled from the
/// HTTP framework so the pipeline can be driven directly in tests.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// HTTP method, normalized to uppercase by the route matcher.
    pub method: String,
    /// Request path, possibly carrying a deployment-stage prefix.
    pub path: String,
    /// Header map with lowercased names.
    pub headers: HashMap<String, String>,
    /// Decoded query string parameters.
    pub query: HashMap<String, String>,
    pub body: Option<String>,
}

impl GatewayRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

/// The response the gateway hands back to the HTTP surface.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl GatewayResponse {
    /// A JSON response carrying the correlation id header.
    pub fn json(status: u16, body: &serde_json::Value, correlation_id: &str) -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert(CORRELATION_HEADER.to_string(), correlation_id.to_string());
        Self {
            status,
            headers,
            body: body.to_string(),
        }
    }

    /// The standard error envelope: `{"error": {code, message, correlationId, details?}}`.
    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        correlation_id: &str,
        details: Option<serde_json::Value>,
    ) -> Self {
        let envelope = ErrorEnvelope {
            error: ErrorDetail {
                code,
                message: message.into(),
                correlation_id: correlation_id.to_string(),
                details,
            },
        };
        let body = serde_json::to_value(&envelope).unwrap_or_default();
        Self::json(code.status(), &body, correlation_id)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Client-visible error codes and their HTTP statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    InternalServerError,
    /// A downstream compute unit ran but failed during execution.
    LambdaExecutionError,
}

impl ErrorCode {
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::InternalServerError => 500,
            ErrorCode::LambdaExecutionError => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::LambdaExecutionError => "LAMBDA_EXECUTION_ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// ============================================================================
// Identity Types
// ============================================================================

/// The two token kinds issued by the identity provider.
///
/// Access tokens carry a `client_id` claim, id tokens carry an `aud`
/// claim; each is validated against the configured client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    Access,
    Id,
}

/// A decoded, verified claim set. Created per request by the token
/// validator and discarded when the response is written; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject id (`sub`).
    pub subject: String,
    /// Display handle resolved from the kind-appropriate username claim.
    pub handle: String,
    pub token_use: TokenUse,
    /// Expiry as a unix timestamp (`exp`).
    pub expires_at: i64,
    pub issuer: String,
    #[serde(default)]
    pub groups: Vec<String>,
    /// The full decoded claim set, forwarded to downstream handlers.
    pub claims: serde_json::Value,
}

// ============================================================================
// Downstream Invocation Types
// ============================================================================

/// Per-request context threaded through dispatch. Created once per inbound
/// call; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<ForwardedUser>,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Verified identity context injected into the forwarding payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedUser {
    pub user_id: String,
    pub username: String,
    pub claims: serde_json::Value,
}

impl From<&Identity> for ForwardedUser {
    fn from(identity: &Identity) -> Self {
        Self {
            user_id: identity.subject.clone(),
            username: identity.handle.clone(),
            claims: identity.claims.clone(),
        }
    }
}

/// The payload sent to a downstream compute unit: the original request
/// reshaped with authoritative path parameters and the verified identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedRequest {
    pub method: String,
    pub path: String,
    pub path_parameters: IndexMap<String, String>,
    pub query_string_parameters: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub request_context: RequestContext,
}

/// What a compute unit must return.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}
