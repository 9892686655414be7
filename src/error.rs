use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::billing::adapters::ProviderError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    Validation(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("trial already used")]
    TrialAlreadyUsed,
    #[error("payment required: {0}")]
    PaymentRequired(String),
    #[error("download quota exhausted")]
    QuotaExceeded,
    #[error("payment provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidState(_) | AppError::TrialAlreadyUsed => StatusCode::CONFLICT,
            AppError::PaymentRequired(_) | AppError::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        // Provider and database internals stay out of response bodies.
        let body = match self {
            AppError::Provider(_) => "payment provider error".to_string(),
            AppError::Db(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
