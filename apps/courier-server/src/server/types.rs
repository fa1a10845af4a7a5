use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{core::METRICS_TEXT_CONTENT_TYPE, metrics::render_metrics};

#[derive(Debug, Serialize)]
pub(crate) struct AuthError {
    pub(crate) error: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics() -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        render_metrics(),
    )
        .into_response()
}

/// Access token for WebSocket clients that cannot set headers. The
/// long-lived refresh token is never read from the URL.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct GatewayAuthQuery {
    pub(crate) access_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SessionResponse {
    pub(crate) user_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshResponse {
    pub(crate) access_token: String,
    pub(crate) expires_in_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct IssueSessionRequest {
    pub(crate) user_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct TokenPairResponse {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
    pub(crate) expires_in_secs: u64,
}
