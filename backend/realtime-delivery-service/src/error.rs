use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use error_types::{error_codes, error_types as kinds, ErrorResponse};
use thiserror::Error;

use crate::fanout::FanoutError;
use crate::presence::PresenceError;
use crate::registry::RegistryError;
use crate::store::StoreError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid presence transition: {0}")]
    InvalidPresenceTransition(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("fanout error: {0}")]
    Fanout(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    /// Transient infrastructure failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Fanout(_) | AppError::ServiceUnavailable(_)
        )
    }

    /// Machine-readable code, shared by HTTP bodies and socket ERROR frames.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
                error_codes::INTERNAL_SERVER_ERROR
            }
            AppError::BadRequest(_) => error_codes::INVALID_REQUEST,
            AppError::InvalidFrame(_) => error_codes::INVALID_FRAME,
            AppError::InvalidPresenceTransition(_) => error_codes::INVALID_PRESENCE_TRANSITION,
            AppError::Unauthorized(msg) if msg.contains("service credential") => {
                error_codes::SERVICE_CREDENTIAL_INVALID
            }
            AppError::Unauthorized(msg) if msg.contains("missing") => error_codes::TOKEN_MISSING,
            AppError::Unauthorized(_) => error_codes::TOKEN_INVALID,
            AppError::Forbidden(_) => error_codes::NOT_CHAT_PARTICIPANT,
            AppError::NotFound("message") => error_codes::MESSAGE_NOT_FOUND,
            AppError::NotFound("notification") => error_codes::NOTIFICATION_NOT_FOUND,
            AppError::NotFound(_) => error_codes::CHAT_NOT_FOUND,
            AppError::RateLimited { .. } => error_codes::RATE_LIMIT_ERROR,
            AppError::Database(_) => error_codes::DATABASE_ERROR,
            AppError::Fanout(_) => error_codes::FANOUT_ERROR,
            AppError::ServiceUnavailable(_) => error_codes::SERVICE_UNAVAILABLE,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_)
            | AppError::InvalidFrame(_)
            | AppError::InvalidPresenceTransition(_) => kinds::VALIDATION_ERROR,
            AppError::Unauthorized(_) => kinds::AUTHENTICATION_ERROR,
            AppError::Forbidden(_) => kinds::AUTHORIZATION_ERROR,
            AppError::NotFound(_) => kinds::NOT_FOUND_ERROR,
            AppError::RateLimited { .. } => kinds::RATE_LIMIT_ERROR,
            AppError::ServiceUnavailable(_) => kinds::SERVICE_UNAVAILABLE_ERROR,
            _ => kinds::SERVER_ERROR,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_)
            | AppError::InvalidFrame(_)
            | AppError::InvalidPresenceTransition(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();

        // Infra details stay in the logs.
        let message = match self {
            AppError::Database(_) | AppError::Fanout(_) | AppError::Config(_) => {
                tracing::error!(error = %self, "request failed");
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let mut body = ErrorResponse::new(
            status.canonical_reason().unwrap_or("Error"),
            &message,
            status.as_u16(),
            self.error_type(),
            self.code(),
        );

        let mut builder = HttpResponse::build(status);
        if let AppError::RateLimited { retry_after_secs } = self {
            body = body.with_retry_after(*retry_after_secs);
            builder.insert_header(("Retry-After", retry_after_secs.to_string()));
        }
        builder.json(body)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<FanoutError> for AppError {
    fn from(e: FanoutError) -> Self {
        AppError::Fanout(e.to_string())
    }
}

impl From<PresenceError> for AppError {
    fn from(e: PresenceError) -> Self {
        AppError::InvalidPresenceTransition(e.to_string())
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        AppError::ServiceUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::InvalidFrame(e.to_string())
    }
}
