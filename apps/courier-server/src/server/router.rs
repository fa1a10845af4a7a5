use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderName, Request, StatusCode},
    middleware,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    core::{AppConfig, AppState},
    handlers::{issue_session, logout, refresh, session},
    realtime::gateway_ws,
    session_gate::require_session,
    types::{health, metrics},
};

/// Build the axum router with global security middleware.
///
/// # Errors
/// Returns an error if the configuration is invalid or the registry store
/// cannot be set up.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    let app_state = AppState::new(config)?;
    Ok(router_with_state(config, app_state))
}

/// Request span that records the path only. The gateway query string can
/// carry an access token.
fn request_span(request: &Request<Body>) -> tracing::Span {
    tracing::info_span!(
        "request",
        method = %request.method(),
        path = request.uri().path(),
        version = ?request.version(),
    )
}

pub(crate) fn router_with_state(config: &AppConfig, app_state: AppState) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");

    let protected = Router::new()
        .route("/auth/session", get(session))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_session,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/internal/sessions", post(issue_session))
        .route("/gateway/ws", get(gateway_ws))
        .merge(protected)
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http().make_span_with(request_span))
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                )),
        )
}
