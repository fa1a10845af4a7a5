#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use courier_server::{build_router, init_tracing, AppConfig};
use tokio::net::TcpListener;

fn env_parsed<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name).map_or_else(
        |_| Ok(default),
        |value| {
            value
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {name} value {value:?}: {e}"))
        },
    )
}

fn env_optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let defaults = AppConfig::default();
    let access_token_secret = env_optional("COURIER_ACCESS_TOKEN_SECRET")
        .ok_or_else(|| anyhow::anyhow!("COURIER_ACCESS_TOKEN_SECRET is required for runtime"))?;
    let refresh_token_secret = env_optional("COURIER_REFRESH_TOKEN_SECRET")
        .ok_or_else(|| anyhow::anyhow!("COURIER_REFRESH_TOKEN_SECRET is required for runtime"))?;
    let access_token_ttl_secs = env_parsed(
        "COURIER_ACCESS_TOKEN_TTL_SECS",
        defaults.access_token_ttl.as_secs(),
    )?;
    let refresh_token_ttl_secs = env_parsed(
        "COURIER_REFRESH_TOKEN_TTL_SECS",
        defaults.refresh_token_ttl.as_secs(),
    )?;
    let request_timeout_secs = env_parsed(
        "COURIER_REQUEST_TIMEOUT_SECS",
        defaults.request_timeout.as_secs(),
    )?;

    let app_config = AppConfig {
        max_body_bytes: env_parsed("COURIER_MAX_BODY_BYTES", defaults.max_body_bytes)?,
        request_timeout: Duration::from_secs(request_timeout_secs),
        gateway_outbound_queue: env_parsed(
            "COURIER_GATEWAY_OUTBOUND_QUEUE",
            defaults.gateway_outbound_queue,
        )?,
        max_gateway_event_bytes: env_parsed(
            "COURIER_MAX_GATEWAY_EVENT_BYTES",
            defaults.max_gateway_event_bytes,
        )?,
        access_token_secret: Some(access_token_secret),
        refresh_token_secret: Some(refresh_token_secret),
        access_token_ttl: Duration::from_secs(access_token_ttl_secs),
        refresh_token_ttl: Duration::from_secs(refresh_token_ttl_secs),
        redis_url: env_optional("COURIER_REDIS_URL"),
        service_key: env_optional("COURIER_SERVICE_KEY"),
        secure_cookies: env_parsed("COURIER_SECURE_COOKIES", defaults.secure_cookies)?,
        ..defaults
    };
    if app_config.redis_url.is_none() {
        tracing::warn!(
            event = "store.in_memory",
            "COURIER_REDIS_URL not set; presence and offline queues are process-local"
        );
    }

    let app = build_router(&app_config)?;
    let addr = std::env::var("COURIER_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:4001"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid COURIER_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "courier-server listening");

    axum::serve(listener, app).await?;
    Ok(())
}
