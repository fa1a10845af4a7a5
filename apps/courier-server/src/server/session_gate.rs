//! Credential resolution for both the WebSocket handshake and plain HTTP
//! requests, including silent access-token rotation from a refresh token.

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE, SET_COOKIE},
        HeaderMap, HeaderName, HeaderValue,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{
    core::{AppState, RuntimeConfig},
    errors::AuthFailure,
    metrics::record_token_rotation,
    tokens::{Principal, TokenService},
};

pub(crate) const ACCESS_TOKEN_COOKIE: &str = "access_token";
pub(crate) const REFRESH_TOKEN_COOKIE: &str = "refresh_token";
pub(crate) const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";
pub(crate) const ROTATED_ACCESS_TOKEN_HEADER: &str = "x-access-token";
const MAX_TOKEN_CHARS: usize = 2048;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub(crate) access_token: Option<String>,
    pub(crate) refresh_token: Option<String>,
}

impl Credentials {
    /// Header values win over cookies.
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            access_token: bearer_token(headers)
                .or_else(|| cookie_value(headers, ACCESS_TOKEN_COOKIE))
                .and_then(usable_token),
            refresh_token: header_value(headers, REFRESH_TOKEN_HEADER)
                .or_else(|| cookie_value(headers, REFRESH_TOKEN_COOKIE))
                .and_then(usable_token),
        }
    }

    /// A query-string access token wins over headers and cookies.
    #[must_use]
    pub(crate) fn with_access_override(self, access_token: Option<String>) -> Self {
        Self {
            access_token: access_token.and_then(usable_token).or(self.access_token),
            refresh_token: self.refresh_token,
        }
    }

    fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GateOutcome {
    Authenticated(Principal),
    /// The access token was missing or invalid but the refresh token held;
    /// the caller must hand the new access token back to the client.
    Rotated {
        principal: Principal,
        access_token: String,
    },
}

impl GateOutcome {
    pub(crate) fn principal(&self) -> &Principal {
        match self {
            Self::Authenticated(principal) | Self::Rotated { principal, .. } => principal,
        }
    }

    pub(crate) fn rotated_access_token(&self) -> Option<&str> {
        match self {
            Self::Authenticated(_) => None,
            Self::Rotated { access_token, .. } => Some(access_token),
        }
    }
}

/// Resolve a [`Principal`]: access token first, then the refresh token,
/// minting a new access token on the refresh path.
pub(crate) fn authenticate(
    tokens: &TokenService,
    credentials: &Credentials,
    surface: &'static str,
) -> Result<GateOutcome, AuthFailure> {
    if credentials.is_empty() {
        tracing::info!(event = "auth.missing_credentials", surface);
        return Err(AuthFailure::MissingCredentials);
    }

    if let Some(principal) = credentials
        .access_token
        .as_deref()
        .and_then(|token| tokens.verify_access(token))
    {
        return Ok(GateOutcome::Authenticated(principal));
    }

    let Some(principal) = credentials
        .refresh_token
        .as_deref()
        .and_then(|token| tokens.verify_refresh(token))
    else {
        tracing::info!(
            event = "auth.rejected",
            surface,
            had_access = credentials.access_token.is_some(),
            had_refresh = credentials.refresh_token.is_some()
        );
        return Err(AuthFailure::Unauthenticated);
    };

    let access_token = tokens
        .issue_access(principal.user_id.as_str())
        .map_err(|error| {
            tracing::error!(event = "auth.rotation_failed", surface, user_id = %principal.user_id, %error);
            AuthFailure::Internal
        })?;
    record_token_rotation(surface);
    tracing::info!(event = "auth.rotated", surface, user_id = %principal.user_id);
    Ok(GateOutcome::Rotated {
        principal,
        access_token,
    })
}

/// Request filter for protected HTTP routes. Puts the [`Principal`] into the
/// request extensions and returns any rotated access token on the response.
pub(crate) async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let credentials = Credentials::from_headers(request.headers());
    let outcome = match authenticate(&state.tokens, &credentials, "http") {
        Ok(outcome) => outcome,
        Err(failure) => return failure.into_response(),
    };
    request.extensions_mut().insert(outcome.principal().clone());

    let mut response = next.run(request).await;
    if let Some(access_token) = outcome.rotated_access_token() {
        attach_rotated_access_token(
            response.headers_mut(),
            access_token,
            &state.tokens,
            &state.runtime,
        );
    }
    response
}

pub(crate) fn attach_rotated_access_token(
    headers: &mut HeaderMap,
    access_token: &str,
    tokens: &TokenService,
    runtime: &RuntimeConfig,
) {
    append_set_cookie(
        headers,
        &token_cookie(
            ACCESS_TOKEN_COOKIE,
            access_token,
            tokens.access_ttl().as_secs(),
            runtime.secure_cookies,
        ),
    );
    if let Ok(value) = HeaderValue::from_str(access_token) {
        headers.insert(HeaderName::from_static(ROTATED_ACCESS_TOKEN_HEADER), value);
    }
}

pub(crate) fn token_cookie(name: &str, value: &str, max_age_secs: u64, secure: bool) -> String {
    let mut cookie =
        format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub(crate) fn expired_cookie(name: &str, secure: bool) -> String {
    token_cookie(name, "", 0, secure)
}

pub(crate) fn append_set_cookie(headers: &mut HeaderMap, cookie: &str) {
    match HeaderValue::from_str(cookie) {
        Ok(value) => {
            headers.append(SET_COOKIE, value);
        }
        Err(error) => {
            tracing::error!(event = "auth.cookie_invalid", %error);
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(ToOwned::to_owned)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(ToOwned::to_owned)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| value.trim().to_owned())
        })
}

fn usable_token(value: String) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.len() > MAX_TOKEN_CHARS {
        return None;
    }
    Some(value.to_owned())
}
