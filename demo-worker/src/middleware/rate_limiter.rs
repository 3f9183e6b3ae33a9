use std::{
    future::{ready, Ready},
    net::AddrParseError,
    rc::Rc,
};

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::StatusCode,
    web, Error as ActixWebError, HttpResponse,
};

use derive_more::Display;
use futures_util::{future::LocalBoxFuture, FutureExt};
use ratelimit_coordinator::CoordinatorError;

use crate::application::{AppState, CARBON_INTENSITY_LIMIT};

pub const RATE_LIMITER_RETRY_AFTER_HTTP_HEADER_NAME: &str = "Retry-After";

pub struct RateLimiterMiddlewareFactory {
    app_state: web::Data<AppState>,
}

impl RateLimiterMiddlewareFactory {
    pub fn with_app_state(app_state: web::Data<AppState>) -> RateLimiterMiddlewareFactory {
        RateLimiterMiddlewareFactory { app_state }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimiterMiddlewareFactory
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixWebError> + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixWebError;
    type InitError = ();
    type Transform = ApiRateLimiterMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ApiRateLimiterMiddleware {
            service: Rc::new(service),
            app_state: self.app_state.clone(),
        }))
    }
}

pub struct ApiRateLimiterMiddleware<S> {
    service: Rc<S>,
    app_state: web::Data<AppState>,
}

impl<S, B> Service<ServiceRequest> for ApiRateLimiterMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixWebError> + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixWebError;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let app_state = self.app_state.clone();
        async move {
            let ip_address = req
                .connection_info()
                .realip_remote_addr()
                .ok_or_else(|| ApiError::InvalidRequest("Missing IP address!".to_string()))?
                .parse()
                .map_err(|e: AddrParseError| ApiError::Internal(e.to_string()))?;

            let limit_name = per_caller_limit_name(ip_address);
            let coordinator = app_state.coordinator.clone();

            // Registration is idempotent per name, so it is safe (if
            // slightly wasteful) to repeat it on every request from a
            // caller we have not seen yet.
            if coordinator
                .register_fixed(&limit_name, app_state.per_caller_limit.clone())
                .is_err()
            {
                tracing::warn!(limit = limit_name, "unable to register per-caller limit");
                return service.call(req).await;
            }

            match coordinator.shift(&limit_name) {
                Ok(_) => service.call(req).await,
                Err(CoordinatorError::RateLimited { retry_after }) => {
                    tracing::warn!(ip = %ip_address, "request throttled");
                    Err(ApiError::RequestThrottled {
                        retry_after_seconds: retry_after.as_secs(),
                    }
                    .into())
                }
                Err(err) => {
                    tracing::warn!(
                        ip = %ip_address,
                        error = %err,
                        "unable to check rate limit for request, skipping validation"
                    );
                    service.call(req).await
                }
            }
        }
        .boxed_local()
    }
}

fn per_caller_limit_name(ip: std::net::IpAddr) -> String {
    format!("{CARBON_INTENSITY_LIMIT}_{}", ip.to_string().replace(['.', ':'], "_"))
}

#[derive(Debug, Display)]
pub enum ApiError {
    RequestThrottled { retry_after_seconds: u64 },
    InvalidRequest(String),
    Internal(String),
}

impl actix_web::error::ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ApiError::RequestThrottled {
                retry_after_seconds,
            } => HttpResponse::build(self.status_code())
                .insert_header((
                    RATE_LIMITER_RETRY_AFTER_HTTP_HEADER_NAME,
                    retry_after_seconds.to_string(),
                ))
                .body("You've been throttled!"),
            _ => HttpResponse::build(self.status_code()).finish(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::RequestThrottled { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn per_caller_limit_name_is_stable_for_the_same_ip() {
        let ip: std::net::IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(per_caller_limit_name(ip), per_caller_limit_name(ip));
        assert!(per_caller_limit_name(ip).starts_with(CARBON_INTENSITY_LIMIT));
    }
}
