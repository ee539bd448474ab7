use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::asset::AssetIdError;
use crate::delivery::DeliveryError;
use crate::error::ErrorKind;
use crate::license::LicenseError;
use crate::packager::PackagerError;
use crate::token::TokenError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error returned to HTTP clients. Carries only generic text; causes are
/// logged where the conversion happens.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status =
            StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorBody {
            error: self.message,
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

impl From<AssetIdError> for ApiError {
    fn from(_: AssetIdError) -> Self {
        ApiError::bad_request("invalid asset id")
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        ApiError::unauthorized(err.to_string())
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        match &err {
            DeliveryError::InvalidName(_) => ApiError::bad_request("invalid segment name"),
            DeliveryError::Unavailable { .. } => ApiError::not_found("manifest not available"),
            DeliveryError::SegmentNotFound { .. } => ApiError::not_found("segment not found"),
            DeliveryError::RangeNotSatisfiable { .. } => {
                ApiError::new(StatusCode::RANGE_NOT_SATISFIABLE, "range not satisfiable")
            }
            DeliveryError::Io { .. } => {
                error!(error = %err, "delivery io failure");
                ApiError::internal("internal error")
            }
        }
    }
}

impl From<LicenseError> for ApiError {
    fn from(err: LicenseError) -> Self {
        if let LicenseError::Internal(cause) = &err {
            error!(cause = %cause, "license failure");
        }
        ApiError::from_kind(err.kind(), err.client_message())
    }
}

impl From<PackagerError> for ApiError {
    fn from(err: PackagerError) -> Self {
        match &err {
            PackagerError::QueueFull => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "admission queue full")
            }
            PackagerError::Io { .. } | PackagerError::Spawn(_) => {
                error!(error = %err, "packager io failure");
                ApiError::internal("internal error")
            }
            _ => {
                if err.kind() == ErrorKind::Internal {
                    error!(error = %err, "packaging failed");
                }
                ApiError::from_kind(err.kind(), err.to_string())
            }
        }
    }
}
