use std::{sync::Arc, time::Duration};

use anyhow::anyhow;

use super::{
    delivery::DeliveryPipeline,
    hub::ConnectionHub,
    store::{in_memory::InMemoryStore, redis_store::RedisStore, RegistryStore},
    tokens::TokenService,
};

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_ACCESS_TOKEN_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_REFRESH_TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;
pub const DEFAULT_GATEWAY_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_GATEWAY_EVENT_BYTES: usize = courier_protocol::MAX_EVENT_BYTES;
pub const DEFAULT_GATEWAY_PING_INTERVAL_SECS: u64 = 30;
pub(crate) const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub gateway_outbound_queue: usize,
    pub max_gateway_event_bytes: usize,
    pub gateway_ping_interval: Duration,
    /// Base64url (unpadded) 32-byte key for access tokens. `None` generates a
    /// per-process key, which only suits tests and local runs.
    pub access_token_secret: Option<String>,
    /// Same shape as `access_token_secret`; must differ from it.
    pub refresh_token_secret: Option<String>,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub redis_url: Option<String>,
    pub service_key: Option<String>,
    pub secure_cookies: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            gateway_outbound_queue: DEFAULT_GATEWAY_OUTBOUND_QUEUE,
            max_gateway_event_bytes: DEFAULT_MAX_GATEWAY_EVENT_BYTES,
            gateway_ping_interval: Duration::from_secs(DEFAULT_GATEWAY_PING_INTERVAL_SECS),
            access_token_secret: None,
            refresh_token_secret: None,
            access_token_ttl: Duration::from_secs(DEFAULT_ACCESS_TOKEN_TTL_SECS),
            refresh_token_ttl: Duration::from_secs(DEFAULT_REFRESH_TOKEN_TTL_SECS),
            redis_url: None,
            service_key: None,
            secure_cookies: false,
        }
    }
}

impl AppConfig {
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.max_gateway_event_bytes > courier_protocol::MAX_EVENT_BYTES {
            return Err(anyhow!(
                "gateway event limit cannot exceed protocol max of {} bytes",
                courier_protocol::MAX_EVENT_BYTES
            ));
        }
        if self.gateway_outbound_queue == 0 {
            return Err(anyhow!("gateway outbound queue must hold at least 1 event"));
        }
        if self.gateway_ping_interval.is_zero() {
            return Err(anyhow!("gateway ping interval must be non-zero"));
        }
        if self.access_token_ttl.is_zero() || self.refresh_token_ttl.is_zero() {
            return Err(anyhow!("token ttls must be at least 1 second"));
        }
        if self.access_token_ttl >= self.refresh_token_ttl {
            return Err(anyhow!(
                "access token ttl must be shorter than refresh token ttl"
            ));
        }
        if self
            .service_key
            .as_deref()
            .is_some_and(|key| key.trim().len() < 16)
        {
            return Err(anyhow!("service key must be at least 16 characters"));
        }
        Ok(())
    }
}

/// Limits the connection loop and cookie writers read on every request.
#[derive(Clone, Debug)]
pub(crate) struct RuntimeConfig {
    pub(crate) gateway_outbound_queue: usize,
    pub(crate) max_gateway_event_bytes: usize,
    pub(crate) gateway_ping_interval: Duration,
    pub(crate) service_key: Option<String>,
    pub(crate) secure_cookies: bool,
}

impl RuntimeConfig {
    fn from_config(config: &AppConfig) -> Self {
        Self {
            gateway_outbound_queue: config.gateway_outbound_queue,
            max_gateway_event_bytes: config.max_gateway_event_bytes,
            gateway_ping_interval: config.gateway_ping_interval,
            service_key: config
                .service_key
                .as_deref()
                .map(str::trim)
                .map(ToOwned::to_owned),
            secure_cookies: config.secure_cookies,
        }
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) tokens: Arc<TokenService>,
    pub(crate) delivery: DeliveryPipeline,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn RegistryStore> = match config.redis_url.as_deref() {
            Some(url) => {
                tracing::info!(event = "store.select", backend = "redis");
                Arc::new(RedisStore::open(url).map_err(|e| anyhow!("redis store: {e}"))?)
            }
            None => {
                tracing::info!(event = "store.select", backend = "in_memory");
                Arc::new(InMemoryStore::default())
            }
        };
        Self::with_store(config, store)
    }

    pub(crate) fn with_store(
        config: &AppConfig,
        store: Arc<dyn RegistryStore>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let tokens = TokenService::from_config(config)?;
        Ok(Self {
            tokens: Arc::new(tokens),
            delivery: DeliveryPipeline::new(store, ConnectionHub::default()),
            runtime: Arc::new(RuntimeConfig::from_config(config)),
        })
    }
}
