use std::time::Duration;

use anyhow::anyhow;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use courier_core::UserId;
use pasetors::{
    claims::{Claims, ClaimsValidationRules},
    keys::{Generate, SymmetricKey},
    local,
    token::UntrustedToken,
    version4::V4,
    Local,
};

use super::core::AppConfig;

const TOKEN_KEY_BYTES: usize = 32;
const ACCESS_IMPLICIT_ASSERTION: &[u8] = b"courier.access";
const REFRESH_IMPLICIT_ASSERTION: &[u8] = b"courier.refresh";

/// Identity resolved from a verified token. Never taken from a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Principal {
    pub(crate) user_id: UserId,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TokenError {
    #[error("tokens cannot be issued for an empty or null-like user id")]
    InvalidPrincipal,
    #[error("token mint failed: {0}")]
    Mint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    const fn implicit_assertion(self) -> &'static [u8] {
        match self {
            Self::Access => ACCESS_IMPLICIT_ASSERTION,
            Self::Refresh => REFRESH_IMPLICIT_ASSERTION,
        }
    }

    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

pub(crate) struct TokenPair {
    pub(crate) access_token: String,
    pub(crate) refresh_token: String,
}

/// Mints and verifies the two independently keyed token kinds.
pub(crate) struct TokenService {
    access_key: SymmetricKey<V4>,
    refresh_key: SymmetricKey<V4>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub(crate) fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let (access_key, refresh_key) = match (
            config.access_token_secret.as_deref(),
            config.refresh_token_secret.as_deref(),
        ) {
            (None, None) => {
                tracing::warn!(
                    event = "tokens.ephemeral_keys",
                    "token secrets not configured; generated per-process keys"
                );
                (
                    SymmetricKey::<V4>::generate()
                        .map_err(|e| anyhow!("access key generation failed: {e}"))?,
                    SymmetricKey::<V4>::generate()
                        .map_err(|e| anyhow!("refresh key generation failed: {e}"))?,
                )
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(anyhow!(
                    "access and refresh token secrets must be set together"
                ));
            }
            (Some(access), Some(refresh)) => {
                let access = decode_secret("access", access)?;
                let refresh = decode_secret("refresh", refresh)?;
                if access == refresh {
                    return Err(anyhow!(
                        "access and refresh token secrets must be different"
                    ));
                }
                (
                    SymmetricKey::<V4>::from(&access)
                        .map_err(|e| anyhow!("invalid access token key: {e}"))?,
                    SymmetricKey::<V4>::from(&refresh)
                        .map_err(|e| anyhow!("invalid refresh token key: {e}"))?,
                )
            }
        };

        Ok(Self {
            access_key,
            refresh_key,
            access_ttl: config.access_token_ttl,
            refresh_ttl: config.refresh_token_ttl,
        })
    }

    pub(crate) fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub(crate) fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub(crate) fn issue_access(&self, user_id: &str) -> Result<String, TokenError> {
        self.issue(TokenKind::Access, user_id)
    }

    pub(crate) fn issue_refresh(&self, user_id: &str) -> Result<String, TokenError> {
        self.issue(TokenKind::Refresh, user_id)
    }

    pub(crate) fn issue_pair(&self, user_id: &str) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access_token: self.issue_access(user_id)?,
            refresh_token: self.issue_refresh(user_id)?,
        })
    }

    /// `None` for anything but a well-formed, unexpired access token signed
    /// with the access key. Never panics on malformed input.
    pub(crate) fn verify_access(&self, token: &str) -> Option<Principal> {
        self.verify(TokenKind::Access, token)
    }

    pub(crate) fn verify_refresh(&self, token: &str) -> Option<Principal> {
        self.verify(TokenKind::Refresh, token)
    }

    fn key(&self, kind: TokenKind) -> &SymmetricKey<V4> {
        match kind {
            TokenKind::Access => &self.access_key,
            TokenKind::Refresh => &self.refresh_key,
        }
    }

    fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        }
    }

    fn issue(&self, kind: TokenKind, user_id: &str) -> Result<String, TokenError> {
        let user_id = UserId::try_from(user_id).map_err(|_| TokenError::InvalidPrincipal)?;
        let mut claims = Claims::new_expires_in(&self.ttl(kind))
            .map_err(|e| TokenError::Mint(format!("claims init failed: {e}")))?;
        claims
            .subject(user_id.as_str())
            .map_err(|e| TokenError::Mint(format!("claim sub failed: {e}")))?;

        local::encrypt(
            self.key(kind),
            &claims,
            None,
            Some(kind.implicit_assertion()),
        )
        .map_err(|e| TokenError::Mint(format!("{} token mint failed: {e}", kind.as_str())))
    }

    fn verify(&self, kind: TokenKind, token: &str) -> Option<Principal> {
        let untrusted = match UntrustedToken::<Local, V4>::try_from(token) {
            Ok(untrusted) => untrusted,
            Err(error) => {
                tracing::debug!(event = "tokens.malformed", kind = kind.as_str(), %error);
                return None;
            }
        };
        let validation_rules = ClaimsValidationRules::new();
        let trusted = match local::decrypt(
            self.key(kind),
            &untrusted,
            &validation_rules,
            None,
            Some(kind.implicit_assertion()),
        ) {
            Ok(trusted) => trusted,
            Err(error) => {
                tracing::debug!(event = "tokens.rejected", kind = kind.as_str(), %error);
                return None;
            }
        };

        let subject = trusted
            .payload_claims()?
            .get_claim("sub")
            .and_then(serde_json::Value::as_str)?;
        let user_id = UserId::try_from(subject).ok()?;
        Some(Principal { user_id })
    }

    #[cfg(test)]
    pub(crate) fn issue_expired(&self, kind: TokenKind, user_id: &str) -> String {
        let mut claims = Claims::new_expires_in(&Duration::from_secs(60)).unwrap();
        claims.subject(user_id).unwrap();
        claims.issued_at("2019-12-31T00:00:00+00:00").unwrap();
        claims.not_before("2019-12-31T00:00:00+00:00").unwrap();
        claims.expiration("2020-01-01T00:00:00+00:00").unwrap();
        local::encrypt(
            self.key(kind),
            &claims,
            None,
            Some(kind.implicit_assertion()),
        )
        .unwrap()
    }
}

fn decode_secret(label: &str, value: &str) -> anyhow::Result<[u8; TOKEN_KEY_BYTES]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value.trim())
        .map_err(|e| anyhow!("{label} token secret is not base64url: {e}"))?;
    <[u8; TOKEN_KEY_BYTES]>::try_from(bytes.as_slice()).map_err(|_| {
        anyhow!(
            "{label} token secret must decode to exactly {TOKEN_KEY_BYTES} bytes, got {}",
            bytes.len()
        )
    })
}
