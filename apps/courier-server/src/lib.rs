#![forbid(unsafe_code)]

mod server;

pub use server::{
    build_router, init_tracing, AppConfig, DEFAULT_ACCESS_TOKEN_TTL_SECS,
    DEFAULT_REFRESH_TOKEN_TTL_SECS,
};
