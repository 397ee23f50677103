//! End-to-end pipeline tests: mock identity provider, mock downstream
//! handlers, real gateway in between.

mod common;

use common::*;
use pf_common::{ErrorCode, ErrorEnvelope, GatewayRequest, CORRELATION_HEADER};
use pf_gateway::auth::{TokenValidator, ValidatorConfig};
use pf_gateway::dispatch::{Dispatcher, HandlerRegistry, HttpInvoker};
use pf_gateway::gateway::{Gateway, GatewayOptions};
use pf_gateway::routes::{default_routes, RouteTable};
use pf_gateway::tracker::{ActivityTracker, NoopActivityStore, TrackerSettings};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn build_gateway(idp: &MockServer, handlers: &MockServer) -> Gateway {
    let validator = Arc::new(TokenValidator::new(ValidatorConfig {
        issuer: idp.uri(),
        client_id: CLIENT_ID.to_string(),
        jwks_url: format!("{}/jwks", idp.uri()),
        cache_ttl: Duration::from_secs(600),
        max_fetches_per_minute: 10,
    }));

    let registry = HandlerRegistry::new(HashMap::from([
        ("posts".to_string(), format!("{}/posts", handlers.uri())),
        ("users".to_string(), format!("{}/users", handlers.uri())),
        ("recipes".to_string(), format!("{}/recipes", handlers.uri())),
    ]));
    let invoker = Arc::new(HttpInvoker::new(Duration::from_secs(5)));
    let tracker = Arc::new(ActivityTracker::new(
        Arc::new(NoopActivityStore),
        TrackerSettings::default(),
    ));

    Gateway::new(
        RouteTable::new(default_routes()),
        validator,
        Arc::new(Dispatcher::new(registry, invoker)),
        tracker,
        GatewayOptions::default(),
    )
}

fn handler_document(status: u16, body: &str) -> Value {
    json!({
        "statusCode": status,
        "headers": {"content-type": "application/json"},
        "body": body,
    })
}

fn with_token(mut req: GatewayRequest, token: &str) -> GatewayRequest {
    req.headers
        .insert("authorization".to_string(), format!("Bearer {token}"));
    req
}

#[tokio::test]
async fn authenticated_request_forwards_identity_context() {
    let idp = MockServer::start().await;
    mount_jwks(&idp).await;
    let handlers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(handler_document(200, "{}")))
        .expect(1)
        .mount(&handlers)
        .await;

    let gw = build_gateway(&idp, &handlers);
    let token = sign(&access_claims(&idp.uri(), "user-1", "alice"));
    let resp = gw
        .handle(with_token(GatewayRequest::new("GET", "/users/42"), &token))
        .await;
    assert_eq!(resp.status, 200);

    let requests = handlers.received_requests().await.unwrap();
    let payload: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(payload["pathParameters"]["userId"], "42");
    assert_eq!(payload["requestContext"]["user"]["userId"], "user-1");
    assert_eq!(payload["requestContext"]["user"]["username"], "alice");
    assert_eq!(payload["method"], "GET");
}

#[tokio::test]
async fn expired_token_never_reaches_the_handler() {
    let idp = MockServer::start().await;
    mount_jwks(&idp).await;
    let handlers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(handler_document(200, "{}")))
        .expect(0)
        .mount(&handlers)
        .await;

    let gw = build_gateway(&idp, &handlers);
    let mut claims = access_claims(&idp.uri(), "user-1", "alice");
    claims["exp"] = json!(chrono::Utc::now().timestamp() - 3600);
    let token = sign(&claims);

    let resp = gw
        .handle(with_token(GatewayRequest::new("GET", "/users/42"), &token))
        .await;
    assert_eq!(resp.status, 401);
    let env: ErrorEnvelope = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(env.error.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn invalid_token_on_public_route_is_forwarded_as_anonymous() {
    let idp = MockServer::start().await;
    mount_jwks(&idp).await;
    let handlers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(handler_document(200, "[]")))
        .expect(1)
        .mount(&handlers)
        .await;

    let gw = build_gateway(&idp, &handlers);
    let mut claims = access_claims(&idp.uri(), "user-1", "alice");
    claims["exp"] = json!(chrono::Utc::now().timestamp() - 3600);
    let token = sign(&claims);

    let resp = gw
        .handle(with_token(GatewayRequest::new("GET", "/feed"), &token))
        .await;
    assert_eq!(resp.status, 200);

    let requests = handlers.received_requests().await.unwrap();
    let payload: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(payload["requestContext"].get("user").is_none());
}

#[tokio::test]
async fn valid_token_on_public_route_personalizes_the_request() {
    let idp = MockServer::start().await;
    mount_jwks(&idp).await;
    let handlers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(handler_document(200, "[]")))
        .mount(&handlers)
        .await;

    let gw = build_gateway(&idp, &handlers);
    let token = sign(&id_claims(&idp.uri(), "user-9", "dana"));
    gw.handle(with_token(GatewayRequest::new("GET", "/feed"), &token))
        .await;

    let requests = handlers.received_requests().await.unwrap();
    let payload: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(payload["requestContext"]["user"]["username"], "dana");
}

#[tokio::test]
async fn handler_embedded_status_is_passed_through() {
    let idp = MockServer::start().await;
    let handlers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(handler_document(
            404,
            r#"{"error":{"code":"NOT_FOUND","message":"no such post"}}"#,
        )))
        .mount(&handlers)
        .await;

    let gw = build_gateway(&idp, &handlers);
    let resp = gw.handle(GatewayRequest::new("GET", "/posts/999")).await;
    assert_eq!(resp.status, 404);
    assert!(resp.body.contains("no such post"));
}

#[tokio::test]
async fn handler_crash_becomes_lambda_execution_error() {
    let idp = MockServer::start().await;
    let handlers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/posts"))
        .respond_with(
            ResponseTemplate::new(502).set_body_string("Traceback: secret internal detail"),
        )
        .mount(&handlers)
        .await;

    let gw = build_gateway(&idp, &handlers);
    let resp = gw.handle(GatewayRequest::new("GET", "/feed")).await;
    assert_eq!(resp.status, 500);

    let env: ErrorEnvelope = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(env.error.code, ErrorCode::LambdaExecutionError);
    assert_eq!(env.error.message, "Internal server error");
    assert!(!resp.body.contains("secret internal detail"));
}

#[tokio::test]
async fn unparseable_handler_document_is_an_execution_fault() {
    let idp = MockServer::start().await;
    let handlers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&handlers)
        .await;

    let gw = build_gateway(&idp, &handlers);
    let resp = gw.handle(GatewayRequest::new("GET", "/feed")).await;
    let env: ErrorEnvelope = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(env.error.code, ErrorCode::LambdaExecutionError);
}

#[tokio::test]
async fn unreachable_handler_is_an_internal_server_error() {
    let idp = MockServer::start().await;

    // bind an ephemeral port and release it so nothing answers there
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let registry = HandlerRegistry::new(HashMap::from([(
        "posts".to_string(),
        format!("http://127.0.0.1:{dead_port}/posts"),
    )]));
    let gw = Gateway::new(
        RouteTable::new(default_routes()),
        Arc::new(TokenValidator::new(ValidatorConfig::new(
            idp.uri(),
            CLIENT_ID,
            format!("{}/jwks", idp.uri()),
        ))),
        Arc::new(Dispatcher::new(
            registry,
            Arc::new(HttpInvoker::new(Duration::from_secs(2))),
        )),
        Arc::new(ActivityTracker::new(
            Arc::new(NoopActivityStore),
            TrackerSettings::default(),
        )),
        GatewayOptions::default(),
    );

    let resp = gw.handle(GatewayRequest::new("GET", "/feed")).await;
    assert_eq!(resp.status, 500);
    let env: ErrorEnvelope = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(env.error.code, ErrorCode::InternalServerError);
}

#[tokio::test]
async fn options_preflight_never_dispatches() {
    let idp = MockServer::start().await;
    let handlers = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(handler_document(200, "{}")))
        .expect(0)
        .mount(&handlers)
        .await;

    let gw = build_gateway(&idp, &handlers);
    let resp = gw.handle(GatewayRequest::new("OPTIONS", "/posts")).await;
    assert_eq!(resp.status, 200);
    assert!(resp.headers.contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn upstream_correlation_id_round_trips() {
    let idp = MockServer::start().await;
    let handlers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/posts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(handler_document(200, "{}")))
        .mount(&handlers)
        .await;

    let gw = build_gateway(&idp, &handlers);
    let mut req = GatewayRequest::new("GET", "/feed");
    req.headers
        .insert("x-correlation-id".to_string(), "trace-42".to_string());
    let resp = gw.handle(req).await;

    assert_eq!(resp.headers.get(CORRELATION_HEADER).unwrap(), "trace-42");
    let requests = handlers.received_requests().await.unwrap();
    let payload: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(payload["requestContext"]["correlationId"], "trace-42");
    assert_eq!(payload["headers"]["x-correlation-id"], "trace-42");
}

#[tokio::test]
async fn unmatched_path_with_valid_token_is_not_found() {
    let idp = MockServer::start().await;
    mount_jwks(&idp).await;
    let handlers = MockServer::start().await;

    let gw = build_gateway(&idp, &handlers);
    // unknown paths fail closed, so present a valid token first
    let token = sign(&access_claims(&idp.uri(), "user-1", "alice"));

    // a known path proves the token works
    Mock::given(method("POST"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(handler_document(200, "{}")))
        .mount(&handlers)
        .await;
    let ok = gw
        .handle(with_token(GatewayRequest::new("GET", "/users/1"), &token))
        .await;
    assert_eq!(ok.status, 200);

    let resp = gw
        .handle(with_token(GatewayRequest::new("GET", "/users/1/badges"), &token))
        .await;
    assert_eq!(resp.status, 404);
    let env: ErrorEnvelope = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(env.error.code, ErrorCode::NotFound);
    assert!(env.error.message.contains("GET"));
    assert!(env.error.message.contains("/users/1/badges"));
}
