use std::sync::Arc;
use std::time::Duration;

use actix_web::{dev::Server, web, App, HttpServer};
use ratelimit_coordinator::builders::coordinator::CoordinatorBuilder;
use ratelimit_coordinator::builders::RedisSettings;
use ratelimit_coordinator::entities::FixedLimitConfig;
use ratelimit_coordinator::Coordinator;
use tracing_actix_web::TracingLogger;

use crate::{
    middleware::rate_limiter::RateLimiterMiddlewareFactory,
    routes::{health_check::health_check, intensity::get_intensity::get_intensity},
    settings::AppSettings,
};

/// Limit name every caller-IP sub-limit is derived from (see
/// [`crate::middleware::rate_limiter`]).
pub const CARBON_INTENSITY_LIMIT: &str = "carbon_intensity_api";

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    /// Base configuration each per-caller sub-limit is registered with;
    /// see [`crate::middleware::rate_limiter`].
    pub per_caller_limit: FixedLimitConfig,
}

pub struct Application {
    http_server: Server,
    port: u16,
}

impl Application {
    /// Builds the main app entrypoint.
    pub fn build(settings: AppSettings) -> Self {
        let coordinator = CoordinatorBuilder::default()
            .with_redis_settings(RedisSettings {
                host: settings.rate_limiter.redis_server.host,
                port: settings.rate_limiter.redis_server.port,
            })
            .build()
            .expect("unable to setup rate limiter component");

        let per_caller_limit = FixedLimitConfig {
            rate: settings.rate_limiter.rate,
            interval: Duration::from_secs(settings.rate_limiter.interval_seconds),
            ..Default::default()
        };

        let app_state = web::Data::new(AppState {
            coordinator: Arc::new(coordinator),
            per_caller_limit,
        });

        let server = HttpServer::new(move || {
            App::new()
                .wrap(TracingLogger::default())
                .app_data(app_state.clone())
                .route("/health_check", web::get().to(health_check))
                .service(
                    web::scope("/carbon/intensity")
                        .wrap(RateLimiterMiddlewareFactory::with_app_state(app_state.clone()))
                        .route("", web::get().to(get_intensity)),
                )
        });

        let actix_server = server
            .bind((settings.http_server.host, settings.http_server.port))
            .expect("unable to build app");

        let port = actix_server.addrs()[0].port();
        let http_server = actix_server.run();
        Application { http_server, port }
    }

    /// The local port this server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Actually starts running and accepting requests.
    pub fn run(self) -> Result<Server, std::io::Error> {
        Ok(self.http_server)
    }
}
