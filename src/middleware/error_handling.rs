use crate::error::AppError;
use actix_web::{http::StatusCode, HttpResponse};
use serde::{Deserialize, Serialize};

/// JSON body returned for every failed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
}

// map domain errors to HTTP responses
pub fn map_error(err: &AppError) -> (StatusCode, ErrorResponse) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    // Internal details never leak to clients.
    let message = match err {
        AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
            "internal server error".to_string()
        }
        other => other.to_string(),
    };

    let response = ErrorResponse {
        error: status
            .canonical_reason()
            .unwrap_or("Error")
            .to_string(),
        message,
        status: status.as_u16(),
        error_type: err.error_type().to_string(),
        code: err.error_code().to_string(),
    };

    (status, response)
}

pub fn into_response(err: &AppError) -> HttpResponse {
    let (status, body) = map_error(err);
    if status.is_server_error() {
        tracing::error!(error = %err, code = body.code, "request failed");
    }
    HttpResponse::build(status).json(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rate_limiter::Dimension;

    #[test]
    fn rate_limited_maps_to_429_body() {
        let (status, body) = map_error(&AppError::RateLimited(Dimension::Room));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.code, "RATE_LIMITED");
        assert_eq!(body.error_type, "rate_limit_error");
        assert_eq!(body.error, "Too Many Requests");
    }

    #[test]
    fn internal_errors_hide_details() {
        let (status, body) = map_error(&AppError::Config("TOKEN_SECRET missing".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, "internal server error");
    }
}
