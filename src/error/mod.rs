use actix_web::{HttpResponse, ResponseError};
use std::fmt;

#[derive(Debug, Clone)]
pub enum AppError {
    // Funding errors
    InputUnavailable(String),
    LockConflict(String),

    // Network errors
    EpochUnavailable(String),
    BroadcastRejected(String),
    BlockchainError(String),

    // Caller errors
    InvalidContextState(String),
    MalformedEnvelope(String),
    ValidationError(String),
    NotFound(String),

    // Database errors
    DatabaseError(String),

    // Configuration errors
    ConfigError(String),

    // Internal errors
    InternalError(String),
}

impl AppError {
    /// Errors the caller can recover from by retrying with different inputs
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AppError::InputUnavailable(_) | AppError::LockConflict(_))
    }

    /// The detail message without the category prefix
    pub fn message(&self) -> &str {
        match self {
            AppError::InputUnavailable(msg)
            | AppError::LockConflict(msg)
            | AppError::EpochUnavailable(msg)
            | AppError::BroadcastRejected(msg)
            | AppError::BlockchainError(msg)
            | AppError::InvalidContextState(msg)
            | AppError::MalformedEnvelope(msg)
            | AppError::ValidationError(msg)
            | AppError::NotFound(msg)
            | AppError::DatabaseError(msg)
            | AppError::ConfigError(msg)
            | AppError::InternalError(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InputUnavailable(msg) => write!(f, "Input unavailable: {}", msg),
            AppError::LockConflict(msg) => write!(f, "Lock conflict: {}", msg),
            AppError::EpochUnavailable(msg) => write!(f, "Epoch unavailable: {}", msg),
            AppError::BroadcastRejected(msg) => write!(f, "Broadcast rejected: {}", msg),
            AppError::BlockchainError(msg) => write!(f, "Blockchain error: {}", msg),
            AppError::InvalidContextState(msg) => write!(f, "Invalid context state: {}", msg),
            AppError::MalformedEnvelope(msg) => write!(f, "Malformed envelope: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let error_message = serde_json::json!({
            "error": self.to_string(),
            "recoverable": self.is_recoverable(),
        });

        match self {
            AppError::ValidationError(_) | AppError::MalformedEnvelope(_) => {
                HttpResponse::BadRequest().json(error_message)
            }
            AppError::NotFound(_) => HttpResponse::NotFound().json(error_message),
            AppError::LockConflict(_) | AppError::InvalidContextState(_) => {
                HttpResponse::Conflict().json(error_message)
            }
            AppError::InputUnavailable(_) => {
                HttpResponse::UnprocessableEntity().json(error_message)
            }
            AppError::BroadcastRejected(_) => HttpResponse::BadGateway().json(error_message),
            AppError::EpochUnavailable(_) => {
                HttpResponse::ServiceUnavailable().json(error_message)
            }
            AppError::BlockchainError(_)
            | AppError::DatabaseError(_)
            | AppError::ConfigError(_)
            | AppError::InternalError(_) => {
                HttpResponse::InternalServerError().json(error_message)
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        AppError::DatabaseError(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalError(format!("JSON error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
