pub(crate) mod core;
pub(crate) mod delivery;
pub(crate) mod errors;
pub(crate) mod gateway_events;
pub(crate) mod handlers;
pub(crate) mod hub;
pub(crate) mod metrics;
pub(crate) mod offline_queue;
pub(crate) mod presence;
pub(crate) mod realtime;
pub(crate) mod router;
pub(crate) mod session;
pub(crate) mod session_gate;
pub(crate) mod store;
pub(crate) mod tokens;
pub(crate) mod types;

pub use core::{AppConfig, DEFAULT_ACCESS_TOKEN_TTL_SECS, DEFAULT_REFRESH_TOKEN_TTL_SECS};
pub use errors::init_tracing;
pub use router::build_router;
