use crate::middleware::error_handling;
use crate::models::{CallEvent, CallStatus};
use crate::services::rate_limiter::Dimension;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        error_handling::into_response(self)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("rate limited ({0})")]
    RateLimited(Dimension),

    /// Relationship or membership check failed (not a friend, blocked, not a member).
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("muted until {until}")]
    Muted { until: chrono::DateTime<chrono::Utc> },

    #[error("message already recalled")]
    AlreadyRecalled,

    #[error("recall window expired (sent_at: {sent_at}, recall_window_secs: {window_secs})")]
    RecallWindowExpired {
        sent_at: chrono::DateTime<chrono::Utc>,
        window_secs: i64,
    },

    #[error("only the sender may recall a message")]
    NotOwner,

    #[error("invalid call state: cannot {event} a call that is {status}")]
    InvalidCallState { status: CallStatus, event: CallEvent },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal server error")]
    Internal,
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}

impl AppError {
    /// Only storage outages are worth retrying; every other variant is a
    /// permanent answer for the request that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::StoreUnavailable(_) | AppError::Internal)
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden
            | AppError::NotAuthorized(_)
            | AppError::Muted { .. }
            | AppError::NotOwner
            | AppError::RecallWindowExpired { .. } => 403,
            AppError::NotFound => 404,
            AppError::InvalidCallState { .. } => 409,
            AppError::AlreadyRecalled => 410, // 410 Gone
            AppError::RateLimited(_) => 429,
            AppError::StoreUnavailable(_) => 503,
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => 500,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
                "INTERNAL_SERVER_ERROR"
            }
            AppError::BadRequest(_) => "INVALID_REQUEST",
            AppError::Unauthorized => "INVALID_CREDENTIALS",
            AppError::Forbidden => "FORBIDDEN",
            AppError::NotFound => "NOT_FOUND",
            AppError::RateLimited(_) => "RATE_LIMITED",
            AppError::NotAuthorized(_) => "NOT_AUTHORIZED",
            AppError::Muted { .. } => "MUTED",
            AppError::AlreadyRecalled => "MESSAGE_ALREADY_RECALLED",
            AppError::RecallWindowExpired { .. } => "RECALL_WINDOW_EXPIRED",
            AppError::NotOwner => "NOT_OWNER",
            AppError::InvalidCallState { .. } => "INVALID_CALL_STATE",
            AppError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self.status_code() {
            400 => "validation_error",
            401 => "authentication_error",
            403 => "authorization_error",
            404 => "not_found_error",
            409 | 410 => "conflict_error",
            429 => "rate_limit_error",
            503 => "unavailable_error",
            _ => "server_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_taxonomy() {
        assert_eq!(AppError::RateLimited(Dimension::Ip).status_code(), 429);
        assert_eq!(AppError::NotAuthorized("blocked".into()).status_code(), 403);
        assert_eq!(AppError::NotOwner.status_code(), 403);
        assert_eq!(AppError::AlreadyRecalled.status_code(), 410);
        assert_eq!(
            AppError::InvalidCallState {
                status: CallStatus::Ended,
                event: CallEvent::Accept,
            }
            .status_code(),
            409
        );
        assert_eq!(AppError::StoreUnavailable("down".into()).status_code(), 503);
    }

    #[test]
    fn only_store_outages_are_retryable() {
        assert!(AppError::StoreUnavailable("redis".into()).is_retryable());
        assert!(!AppError::RateLimited(Dimension::Connection).is_retryable());
        assert!(!AppError::NotOwner.is_retryable());
        assert!(!AppError::Forbidden.is_retryable());
    }

    #[test]
    fn invalid_call_state_message_names_transition() {
        let err = AppError::InvalidCallState {
            status: CallStatus::Ringing,
            event: CallEvent::End,
        };
        assert_eq!(
            err.to_string(),
            "invalid call state: cannot end a call that is ringing"
        );
    }
}
