// Error types for the Promotion & Pricing engine
//
// "Promotion does not apply" is a business outcome and is reported through result
// structs with reason lists. The variants below are faults: bad input, lost races
// on usage limits, and collaborators that could not be reached.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;

use crate::promotions::types::PromotionRef;

/// Main error type for the pricing engine
#[derive(Debug, Error)]
pub enum PromotionError {
    /// Bad input shape: missing code, malformed date string, negative amount
    #[error("Validation failed: {0}")]
    ValidationError(String),

    /// Promotion type exists in the data model but has no defined semantics
    #[error("Unsupported promotion type: {0}")]
    UnsupportedPromotionType(String),

    /// A usage counter would exceed its limit under concurrent confirmation
    #[error("Promotion {promotion} was exhausted: {reason}")]
    ConcurrencyConflict {
        promotion: PromotionRef,
        reason: String,
    },

    /// Store or cache could not be reached in time
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    CacheError(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration not found: {0}")]
    ConfigurationNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type alias for pricing engine operations
pub type PResult<T> = Result<T, PromotionError>;

impl PromotionError {
    /// Whether this fault comes from an unreachable collaborator
    ///
    /// Upstream faults degrade pricing to base price instead of failing the flow.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            PromotionError::UpstreamUnavailable(_)
                | PromotionError::DatabaseError(_)
                | PromotionError::CacheError(_)
        )
    }

    fn error_code(&self) -> &'static str {
        match self {
            PromotionError::ValidationError(_) => "VALIDATION_ERROR",
            PromotionError::UnsupportedPromotionType(_) => "UNSUPPORTED_PROMOTION_TYPE",
            PromotionError::ConcurrencyConflict { .. } => "PROMOTION_EXHAUSTED",
            PromotionError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            PromotionError::DatabaseError(_) => "DATABASE_ERROR",
            PromotionError::CacheError(_) => "CACHE_ERROR",
            PromotionError::JsonError(_) => "JSON_ERROR",
            PromotionError::ConfigurationNotFound(_) => "CONFIGURATION_NOT_FOUND",
            PromotionError::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            PromotionError::ValidationError(_) => StatusCode::BAD_REQUEST,
            PromotionError::UnsupportedPromotionType(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PromotionError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            PromotionError::UpstreamUnavailable(_) | PromotionError::CacheError(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PromotionError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PromotionError::JsonError(_) => StatusCode::BAD_REQUEST,
            PromotionError::ConfigurationNotFound(_) => StatusCode::NOT_FOUND,
            PromotionError::InvalidConfiguration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<validator::ValidationErrors> for PromotionError {
    fn from(err: validator::ValidationErrors) -> Self {
        PromotionError::ValidationError(err.to_string())
    }
}

impl IntoResponse for PromotionError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the logs
        let message = match &self {
            PromotionError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                "A database error occurred".to_string()
            }
            PromotionError::CacheError(e) => {
                tracing::error!("Cache error: {:?}", e);
                "Pricing cache is unavailable".to_string()
            }
            PromotionError::InvalidConfiguration(msg) => {
                tracing::error!("Invalid configuration: {}", msg);
                "Pricing configuration is invalid".to_string()
            }
            PromotionError::ConcurrencyConflict { .. } | PromotionError::UpstreamUnavailable(_) => {
                tracing::warn!("{}", self);
                self.to_string()
            }
            _ => {
                tracing::debug!("{}", self);
                self.to_string()
            }
        };

        let body = Json(json!({
            "error_code": self.error_code(),
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}
