use std::time::Duration;

use axum::{body::Body, http::Request, http::StatusCode};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use courier_server::{build_router, AppConfig};
use serde_json::json;
use tower::ServiceExt;

const SERVICE_KEY: &str = "security-limits-service-key";

fn secret(fill: u8) -> String {
    URL_SAFE_NO_PAD.encode([fill; 32])
}

#[tokio::test]
async fn rejects_body_over_limit() {
    let config = AppConfig {
        max_body_bytes: 32,
        request_timeout: Duration::from_secs(1),
        service_key: Some(String::from(SERVICE_KEY)),
        ..AppConfig::default()
    };
    let app = build_router(&config).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/internal/sessions")
        .header("content-type", "application/json")
        .header("x-service-key", SERVICE_KEY)
        .body(Body::from(
            json!({"user_id": "this-user-id-is-definitely-too-long-for-the-limit"}).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn unknown_fields_in_session_requests_are_rejected() {
    let config = AppConfig {
        service_key: Some(String::from(SERVICE_KEY)),
        ..AppConfig::default()
    };
    let app = build_router(&config).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/internal/sessions")
        .header("content-type", "application/json")
        .header("x-service-key", SERVICE_KEY)
        .body(Body::from(
            json!({"user_id": "alice", "role": "admin"}).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
    assert!(response.headers().get("set-cookie").is_none());
}

#[tokio::test]
async fn configured_secrets_are_validated_at_startup() {
    let valid = AppConfig {
        access_token_secret: Some(secret(1)),
        refresh_token_secret: Some(secret(2)),
        ..AppConfig::default()
    };
    assert!(build_router(&valid).is_ok());

    let only_one = AppConfig {
        access_token_secret: Some(secret(1)),
        ..AppConfig::default()
    };
    assert!(build_router(&only_one).is_err());

    let shared = AppConfig {
        access_token_secret: Some(secret(3)),
        refresh_token_secret: Some(secret(3)),
        ..AppConfig::default()
    };
    assert!(build_router(&shared).is_err());

    let short = AppConfig {
        access_token_secret: Some(URL_SAFE_NO_PAD.encode([1_u8; 16])),
        refresh_token_secret: Some(secret(2)),
        ..AppConfig::default()
    };
    assert!(build_router(&short).is_err());
}

#[tokio::test]
async fn inconsistent_limits_are_rejected_at_startup() {
    let ttl_inverted = AppConfig {
        access_token_ttl: Duration::from_secs(7200),
        refresh_token_ttl: Duration::from_secs(3600),
        ..AppConfig::default()
    };
    assert!(build_router(&ttl_inverted).is_err());

    let no_queue = AppConfig {
        gateway_outbound_queue: 0,
        ..AppConfig::default()
    };
    assert!(build_router(&no_queue).is_err());

    let weak_service_key = AppConfig {
        service_key: Some(String::from("letmein")),
        ..AppConfig::default()
    };
    assert!(build_router(&weak_service_key).is_err());
}

#[tokio::test]
async fn malformed_redis_url_is_rejected_at_startup() {
    let config = AppConfig {
        redis_url: Some(String::from("not a redis url")),
        ..AppConfig::default()
    };
    assert!(build_router(&config).is_err());
}
