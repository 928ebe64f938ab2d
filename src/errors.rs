use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::ReservationStatus;

pub type Result<T> = std::result::Result<T, InventoryError>;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("reservation not found: {0}")]
    NotFound(Uuid),

    #[error("reservation {id} is {status}; transition not permitted")]
    BadState { id: Uuid, status: ReservationStatus },

    #[error("reservation {0} has expired")]
    Expired(Uuid),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    Insufficient {
        product_id: String,
        requested: i32,
        available: i32,
    },

    #[error("version conflict on product {0}: row was modified by another transaction")]
    VersionConflict(String),

    #[error("quantity underflow for product {product_id}: current {current}, change {change}")]
    Underflow {
        product_id: String,
        current: i32,
        change: i32,
    },

    #[error("quantity overflow for product {product_id}: current {current}, change {change}")]
    Overflow {
        product_id: String,
        current: i32,
        change: i32,
    },

    #[error("stock row already exists for product {0}")]
    Conflict(String),

    #[error("deadline exceeded")]
    Cancelled,

    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for InventoryError {
    fn from(err: serde_json::Error) -> Self {
        InventoryError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl<T> From<async_nats::error::Error<T>> for InventoryError
where
    T: std::fmt::Debug + std::fmt::Display + Clone + PartialEq,
{
    fn from(err: async_nats::error::Error<T>) -> Self {
        InventoryError::Bus(format!("{:?}", err))
    }
}

impl From<async_nats::SubscribeError> for InventoryError {
    fn from(err: async_nats::SubscribeError) -> Self {
        InventoryError::Bus(format!("subscribe error: {}", err))
    }
}

impl ResponseError for InventoryError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            InventoryError::Validation(_) => StatusCode::BAD_REQUEST,
            InventoryError::NotFound(_) => StatusCode::NOT_FOUND,
            InventoryError::BadState { .. } => StatusCode::BAD_REQUEST,
            InventoryError::Expired(_) => StatusCode::BAD_REQUEST,
            InventoryError::Insufficient { .. } => StatusCode::BAD_REQUEST,
            InventoryError::VersionConflict(_) => StatusCode::CONFLICT,
            InventoryError::Underflow { .. } => StatusCode::BAD_REQUEST,
            InventoryError::Overflow { .. } => StatusCode::BAD_REQUEST,
            InventoryError::Conflict(_) => StatusCode::CONFLICT,
            InventoryError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            InventoryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            InventoryError::Bus(_) => StatusCode::SERVICE_UNAVAILABLE,
            InventoryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl InventoryError {
    pub fn error_type(&self) -> &'static str {
        match self {
            InventoryError::Validation(_) => "validation_error",
            InventoryError::NotFound(_) => "not_found",
            InventoryError::BadState { .. } => "bad_state",
            InventoryError::Expired(_) => "expired",
            InventoryError::Insufficient { .. } => "insufficient",
            InventoryError::VersionConflict(_) => "version_conflict",
            InventoryError::Underflow { .. } => "underflow",
            InventoryError::Overflow { .. } => "overflow",
            InventoryError::Conflict(_) => "duplicate_error",
            InventoryError::Cancelled => "cancelled",
            InventoryError::Storage(_) => "database_error",
            InventoryError::Bus(_) => "messaging_error",
            InventoryError::Internal(_) => "internal_error",
        }
    }

    /// True for errors a caller may resolve by retrying the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InventoryError::VersionConflict(_))
    }
}
