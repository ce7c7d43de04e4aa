//! Request extractors that authenticate before a handler runs.

use actix_web::{web, FromRequest, HttpRequest};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

use super::auth::bearer_token;
use crate::error::AppError;
use crate::state::AppState;

pub const INTERNAL_TOKEN_HEADER: &str = "X-Internal-Token";

/// A user authenticated by bearer token and admitted by the rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser {
    pub id: Uuid,
}

fn app_state(req: &HttpRequest) -> Result<web::Data<AppState>, AppError> {
    req.app_data::<web::Data<AppState>>()
        .cloned()
        .ok_or(AppError::Internal)
}

impl FromRequest for AuthenticatedUser {
    type Error = AppError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, Self::Error>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let header = req
            .headers()
            .get(actix_web::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .map(str::to_owned);
        let state = app_state(req);

        Box::pin(async move {
            let state = state?;
            let token = bearer_token(header.as_deref())?;
            let id = state.auth.validate(token)?;
            state.rate_limiter.check(id, "http").await?;
            Ok(AuthenticatedUser { id })
        })
    }
}

/// Service-to-service caller presenting the shared internal credential.
#[derive(Debug, Clone, Copy)]
pub struct InternalService;

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl FromRequest for InternalService {
    type Error = AppError;
    type Future = std::future::Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let result = app_state(req).and_then(|state| {
            let presented = req
                .headers()
                .get(INTERNAL_TOKEN_HEADER)
                .and_then(|h| h.to_str().ok())
                .ok_or_else(|| AppError::Unauthorized("internal token missing".into()))?;
            if constant_time_eq(
                presented.as_bytes(),
                state.config.internal_service_token.as_bytes(),
            ) {
                Ok(InternalService)
            } else {
                tracing::warn!(path = %req.path(), "rejected internal call with bad credential");
                Err(AppError::Unauthorized("invalid service credential".into()))
            }
        });
        std::future::ready(result)
    }
}
