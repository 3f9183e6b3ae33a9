use config::{Config, ConfigError, Environment};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    pub http_server: ServerSettings,
    pub rate_limiter: RateLimiterSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimiterSettings {
    /// Calls admitted per `interval_seconds`, per caller IP.
    pub rate: u32,
    pub interval_seconds: u64,
    pub redis_server: ServerSettings,
}

const DEFAULT_HTTP_SERVER_HOST: &str = "0.0.0.0";
const DEFAULT_HTTP_SERVER_PORT: u16 = 9000;
const DEFAULT_RATE_LIMITER_RATE: u32 = 5;
const DEFAULT_RATE_LIMITER_INTERVAL_SECONDS: u64 = 15;
const DEFAULT_REDIS_SERVER_HOST: &str = "127.0.0.1";
const DEFAULT_REDIS_SERVER_PORT: u16 = 6379;

impl AppSettings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .set_default("http_server.host", DEFAULT_HTTP_SERVER_HOST)?
            .set_default("http_server.port", DEFAULT_HTTP_SERVER_PORT)?
            .set_default("rate_limiter.rate", DEFAULT_RATE_LIMITER_RATE)?
            .set_default(
                "rate_limiter.interval_seconds",
                DEFAULT_RATE_LIMITER_INTERVAL_SECONDS,
            )?
            .set_default("rate_limiter.redis_server.host", DEFAULT_REDIS_SERVER_HOST)?
            .set_default("rate_limiter.redis_server.port", DEFAULT_REDIS_SERVER_PORT)?
            .add_source(Environment::default())
            .add_source(
                Environment::with_prefix("app")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        config_builder.try_deserialize()
    }
}
