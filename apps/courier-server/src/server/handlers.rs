use axum::{
    extract::{Extension, Json, State},
    http::{HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};

use super::{
    core::AppState,
    errors::AuthFailure,
    metrics::record_token_rotation,
    session_gate::{
        append_set_cookie, expired_cookie, token_cookie, Credentials, ACCESS_TOKEN_COOKIE,
        REFRESH_TOKEN_COOKIE,
    },
    tokens::{Principal, TokenError},
    types::{IssueSessionRequest, RefreshResponse, SessionResponse, TokenPairResponse},
};

const SERVICE_KEY_HEADER: &str = "x-service-key";

pub(crate) async fn session(Extension(principal): Extension<Principal>) -> Json<SessionResponse> {
    Json(SessionResponse {
        user_id: principal.user_id.to_string(),
    })
}

/// Explicit refresh: re-mint the access token from a valid refresh token.
pub(crate) async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AuthFailure> {
    let credentials = Credentials::from_headers(&headers);
    let refresh_token = credentials
        .refresh_token
        .ok_or(AuthFailure::MissingCredentials)?;
    let principal = state
        .tokens
        .verify_refresh(&refresh_token)
        .ok_or(AuthFailure::Unauthenticated)?;
    let access_token = state
        .tokens
        .issue_access(principal.user_id.as_str())
        .map_err(|error| {
            tracing::error!(event = "auth.refresh_failed", user_id = %principal.user_id, %error);
            AuthFailure::Internal
        })?;
    record_token_rotation("refresh_route");
    tracing::info!(event = "auth.refreshed", user_id = %principal.user_id);

    let expires_in_secs = state.tokens.access_ttl().as_secs();
    let mut response = Json(RefreshResponse {
        access_token: access_token.clone(),
        expires_in_secs,
    })
    .into_response();
    append_set_cookie(
        response.headers_mut(),
        &token_cookie(
            ACCESS_TOKEN_COOKIE,
            &access_token,
            expires_in_secs,
            state.runtime.secure_cookies,
        ),
    );
    Ok(response)
}

/// Tokens are stateless, so logout only clears the client's cookies.
pub(crate) async fn logout(State(state): State<AppState>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    for name in [ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE] {
        append_set_cookie(
            response.headers_mut(),
            &expired_cookie(name, state.runtime.secure_cookies),
        );
    }
    response
}

/// Token-pair minting for the credential service that performs login.
pub(crate) async fn issue_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<IssueSessionRequest>,
) -> Result<Response, AuthFailure> {
    let expected = state
        .runtime
        .service_key
        .as_deref()
        .ok_or(AuthFailure::NotFound)?;
    let presented = headers
        .get(HeaderName::from_static(SERVICE_KEY_HEADER))
        .and_then(|value| value.to_str().ok())
        .ok_or(AuthFailure::MissingCredentials)?;
    if !service_key_matches(presented, expected) {
        tracing::warn!(event = "auth.service_key_rejected");
        return Err(AuthFailure::Forbidden);
    }

    let pair = state
        .tokens
        .issue_pair(&payload.user_id)
        .map_err(|error| match error {
            TokenError::InvalidPrincipal => AuthFailure::InvalidRequest,
            TokenError::Mint(_) => {
                tracing::error!(event = "auth.issue_failed", %error);
                AuthFailure::Internal
            }
        })?;
    tracing::info!(event = "auth.session_issued", user_id = %payload.user_id);

    let access_ttl = state.tokens.access_ttl().as_secs();
    let refresh_ttl = state.tokens.refresh_ttl().as_secs();
    let secure = state.runtime.secure_cookies;
    let mut response = Json(TokenPairResponse {
        access_token: pair.access_token.clone(),
        refresh_token: pair.refresh_token.clone(),
        expires_in_secs: access_ttl,
    })
    .into_response();
    append_set_cookie(
        response.headers_mut(),
        &token_cookie(ACCESS_TOKEN_COOKIE, &pair.access_token, access_ttl, secure),
    );
    append_set_cookie(
        response.headers_mut(),
        &token_cookie(REFRESH_TOKEN_COOKIE, &pair.refresh_token, refresh_ttl, secure),
    );
    Ok(response)
}

/// Compares digests so the running time does not depend on where the
/// presented key first differs.
fn service_key_matches(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.trim().as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0_u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}
