use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::engine_error::{EngineError, ErrorKind};
use crate::models::MatchId;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Engine(#[from] EngineError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    match_id: Option<MatchId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadRequest | ErrorKind::UserRejected => StatusCode::BAD_REQUEST,
        ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ActiveMatchConflict => StatusCode::CONFLICT,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::ResultsPending | ErrorKind::ResultsTemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ServerError | ErrorKind::Network => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout | ErrorKind::QueueTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(err) => status_for(err.kind),
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let body = match self {
            ApiError::Engine(err) => ErrorResponse {
                error: err.message.clone(),
                code: status.as_u16(),
                kind: Some(err.kind),
                match_id: err.match_id,
                attempts: (err.attempts > 0).then_some(err.attempts),
                retry_after_ms: err.retry_after.map(|d| d.as_millis() as u64),
            },
            ApiError::BadRequest(_) => ErrorResponse {
                error: self.to_string(),
                code: status.as_u16(),
                kind: Some(ErrorKind::BadRequest),
                match_id: None,
                attempts: None,
                retry_after_ms: None,
            },
        };

        HttpResponse::build(status).json(body)
    }
}
