use serde::{Deserialize, Serialize};

/// Uniform JSON error body returned by every HTTP endpoint.
///
/// Clients branch on `error_type` for coarse handling (retry, re-authenticate,
/// show validation message) and on `code` for specific cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short HTTP reason phrase, e.g. "Not Found"
    pub error: String,

    /// Human readable explanation
    pub message: String,

    /// HTTP status code
    pub status: u16,

    /// One of the constants in [`error_types`]
    pub error_type: String,

    /// One of the constants in [`error_codes`]
    pub code: String,

    /// Extra context, only filled in for non-production builds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Seconds the client should wait before retrying (rate limiting)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,

    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, status: u16, error_type: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            status,
            error_type: error_type.to_string(),
            code: code.to_string(),
            details: None,
            retry_after: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

/// Error codes used by the realtime delivery service
pub mod error_codes {
    // Authentication
    pub const TOKEN_INVALID: &str = "TOKEN_INVALID";
    pub const TOKEN_MISSING: &str = "TOKEN_MISSING";
    pub const SERVICE_CREDENTIAL_INVALID: &str = "SERVICE_CREDENTIAL_INVALID";

    // Chat
    pub const CHAT_NOT_FOUND: &str = "CHAT_NOT_FOUND";
    pub const MESSAGE_NOT_FOUND: &str = "MESSAGE_NOT_FOUND";
    pub const NOT_CHAT_PARTICIPANT: &str = "NOT_CHAT_PARTICIPANT";
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

    // Notifications
    pub const NOTIFICATION_NOT_FOUND: &str = "NOTIFICATION_NOT_FOUND";

    // Presence
    pub const INVALID_PRESENCE_TRANSITION: &str = "INVALID_PRESENCE_TRANSITION";

    // System
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const FANOUT_ERROR: &str = "FANOUT_ERROR";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const RATE_LIMIT_ERROR: &str = "RATE_LIMIT_EXCEEDED";
}

/// Standard error types
pub mod error_types {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const AUTHENTICATION_ERROR: &str = "authentication_error";
    pub const AUTHORIZATION_ERROR: &str = "authorization_error";
    pub const NOT_FOUND_ERROR: &str = "not_found_error";
    pub const CONFLICT_ERROR: &str = "conflict_error";
    pub const RATE_LIMIT_ERROR: &str = "rate_limit_error";
    pub const SERVER_ERROR: &str = "server_error";
    pub const SERVICE_UNAVAILABLE_ERROR: &str = "service_unavailable_error";
}
