// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MongoDB error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Gateway returned HTTP {status}: {message}")]
    GatewayHttp { status: u16, message: String },

    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Malformed gateway response: {0}")]
    MalformedResponse(String),

    #[error("{0}")]
    InvalidTransaction(String),

    #[error("Transaction {0} has already been initiated")]
    AlreadyInitiated(String),

    #[error("Duplicate key error")]
    DuplicateKey,

    #[error("Unauthorized access")]
    Unauthorized,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(_) | AppError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error")
            }
            AppError::Auth(_) => (StatusCode::BAD_GATEWAY, "Gateway authentication failed"),
            AppError::GatewayHttp { .. } => (StatusCode::BAD_GATEWAY, "M-Pesa error"),
            AppError::GatewayUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "M-Pesa unavailable")
            }
            AppError::MalformedResponse(_) => (StatusCode::BAD_GATEWAY, "Malformed M-Pesa response"),
            AppError::InvalidTransaction(_) => (StatusCode::NOT_FOUND, "Invalid Transaction"),
            AppError::AlreadyInitiated(_) => (StatusCode::CONFLICT, "Transaction already initiated"),
            AppError::DuplicateKey => (StatusCode::CONFLICT, "Duplicate entry"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized access"),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "Validation failed"),
            AppError::ConfigurationError(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error")
            }
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error"),
        };

        let body = Json(json!({
            "error": error_message,
            "message": self.to_string(),
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::MalformedResponse(format!("JSON parsing error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::GatewayUnavailable(format!("HTTP request failed: {}", err))
    }
}

impl From<mongodb::bson::ser::Error> for AppError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        AppError::Store(format!("BSON serialization error: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

// Helper conversion functions
impl AppError {
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        AppError::MalformedResponse(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        AppError::Auth(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::ConfigurationError(msg.into())
    }

    pub fn invalid_transaction() -> Self {
        AppError::InvalidTransaction("Invalid Transaction".to_string())
    }

    /// Duplicate-key write failures from a unique index (code 11000).
    pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
        use mongodb::error::{ErrorKind, WriteFailure};
        match err.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
            ErrorKind::Command(command_error) => command_error.code == 11000,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
