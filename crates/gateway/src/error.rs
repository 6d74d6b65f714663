use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Gateway errors with their HTTP status mapping.
///
/// Codec errors are always local-fatal to the request and never retried;
/// transport errors drive the retry loop in the handler.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request body did not match the detected wire format.
    #[error("{0}")]
    InvalidRequest(String),

    /// No provider could be resolved for the requested model.
    #[error("Unknown provider for model '{0}'")]
    UnknownProvider(String),

    /// No credentials configured for the resolved provider.
    #[error("No credentials configured for provider '{0}'")]
    NoCredentials(String),

    /// Every account and fallback is rate-limited.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The upstream could not be reached after bounded retries.
    #[error("Upstream connection error: {0}")]
    UpstreamNetwork(String),

    /// The upstream returned a non-retriable error body, passed through.
    #[error("Upstream error ({status}): {body}")]
    Upstream {
        /// Upstream HTTP status.
        status: u16,
        /// Upstream response body, JSON when possible.
        body: String,
    },

    /// The client went away; no response is emitted.
    #[error("Request cancelled")]
    Cancelled,

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// The HTTP status code surfaced to the client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::UnknownProvider(_) => StatusCode::BAD_REQUEST,
            Self::NoCredentials(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamNetwork(_) => StatusCode::BAD_GATEWAY,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Cancelled | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Upstream JSON bodies pass through verbatim; everything else is
        // wrapped into the {"error": "..."} shape.
        if let GatewayError::Upstream { body, .. } = &self
            && let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
        {
            return (status, Json(value)).into_response();
        }

        let body = ErrorBody {
            error: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
