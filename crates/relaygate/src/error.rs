//! Gateway error types and their client-visible rendering.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Authentication(String),

    #[error("No model mapping found for: {0}.")]
    ModelNotMapped(String),

    #[error("No upstream credential available for owner {0}")]
    NoCredentialAvailable(String),

    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("secret resolution failed: {0}")]
    Secret(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GatewayError {
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Map a transport failure onto an upstream error. Timeouts become 504,
    /// everything else 502.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let status = if err.is_timeout() { 504 } else { 502 };
        Self::upstream(status, err.to_string())
    }

    /// Anthropic error `type` string for the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication_error",
            Self::ModelNotMapped(_) | Self::NoCredentialAvailable(_) | Self::InvalidRequest(_) => {
                "invalid_request_error"
            }
            Self::Upstream { status: 429, .. } => "rate_limit_error",
            Self::Upstream { .. } | Self::Secret(_) | Self::Store(_) => "api_error",
        }
    }

    /// Upstream status to attach to telemetry, if this error carries one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::ModelNotMapped(_) | Self::NoCredentialAvailable(_) | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Secret(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "type": "error",
            "error": {"type": self.kind(), "message": self.to_string()},
        }))
    }
}
