//! Gateway error taxonomy
//!
//! Every error carries a stable `kind` tag (sent in socket `error` envelopes
//! and HTTP error bodies) and an HTTP status for the control plane.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use tether_core::{MeterError, ProviderError};

use crate::protocol::ErrorBody;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("connection '{0}' not found")]
    ConnectionNotFound(String),

    #[error("token is expired, unknown or already consumed")]
    TokenInvalid,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("connection '{0}' is already authenticated")]
    AlreadyAuthenticated(String),

    #[error("insufficient credits (balance {balance})")]
    InsufficientCredits { balance: f64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection busy: {0} requests already waiting")]
    Busy(usize),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Stable tag for clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionNotFound(_) => "ConnectionNotFound",
            Self::TokenInvalid => "TokenInvalid",
            Self::Unauthorized(_) => "Unauthorized",
            Self::AlreadyAuthenticated(_) => "AlreadyAuthenticated",
            Self::InsufficientCredits { .. } => "InsufficientCredits",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Busy(_) => "Busy",
            Self::Provider(err) => err.kind(),
            Self::Internal(_) => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
            Self::TokenInvalid => StatusCode::GONE,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::AlreadyAuthenticated(_) => StatusCode::CONFLICT,
            Self::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Provider(ProviderError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Provider(
                ProviderError::UnknownProvider(_) | ProviderError::NotConfigured(_),
            ) => StatusCode::BAD_REQUEST,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MeterError> for GatewayError {
    fn from(err: MeterError) -> Self {
        match err {
            MeterError::UnknownUser(user) => {
                Self::Unauthorized(format!("user '{}' has no account", user))
            }
            MeterError::InsufficientCredits { balance } => Self::InsufficientCredits { balance },
            MeterError::Store(msg) => Self::Internal(msg),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::ConnectionNotFound("c".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(GatewayError::TokenInvalid.status(), StatusCode::GONE);
        assert_eq!(
            GatewayError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GatewayError::Busy(4).status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            GatewayError::from(ProviderError::Timeout(Duration::from_secs(1))).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::from(ProviderError::Transport("reset".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::from(ProviderError::UnknownProvider("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_provider_kind_passes_through() {
        let err = GatewayError::from(ProviderError::RateLimited {
            retry_after_ms: 100,
        });
        assert_eq!(err.kind(), "ProviderRateLimited");
        assert_eq!(err.to_string(), "rate limited: retry after 100ms");
    }

    #[test]
    fn test_meter_errors_map() {
        assert_eq!(
            GatewayError::from(MeterError::InsufficientCredits { balance: -0.5 }).kind(),
            "InsufficientCredits"
        );
        assert_eq!(
            GatewayError::from(MeterError::UnknownUser("ghost".into())).kind(),
            "Unauthorized"
        );
        assert_eq!(
            GatewayError::from(MeterError::Store("locked".into())).kind(),
            "Internal"
        );
    }

    #[test]
    fn test_into_response_status() {
        let response = GatewayError::TokenInvalid.into_response();
        assert_eq!(response.status(), StatusCode::GONE);
    }
}
