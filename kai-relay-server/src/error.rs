//! Mapping of exchange failures to HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kai_relay_exchange::{ErrorKind, ExchangeError};
use serde::{Deserialize, Serialize};

/// Structured failure payload, shared by JSON responses and SSE `error` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub kind: ErrorKind,
    pub retryable: bool,
    pub detail: String,
}

impl From<&ExchangeError> for ErrorBody {
    fn from(err: &ExchangeError) -> Self {
        Self {
            ok: false,
            kind: err.kind(),
            retryable: err.is_retryable(),
            detail: err.detail(),
        }
    }
}

/// Handler error wrapping an [`ExchangeError`]
#[derive(Debug)]
pub struct ApiError(pub ExchangeError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::UpstreamRejected | ErrorKind::StreamInterrupted => StatusCode::BAD_GATEWAY,
            ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ExchangeError> for ApiError {
    fn from(err: ExchangeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed ({}): {}", self.0.kind(), self.0);
        } else {
            tracing::debug!("Request rejected ({}): {}", self.0.kind(), self.0);
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kai_relay_exchange::ValidationError;
    use kai_relay_providers::UpstreamError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ExchangeError::from(ValidationError::new("no user message")), 400),
            (
                UpstreamError::Rejected {
                    status: 401,
                    detail: "bad key".into(),
                }
                .into(),
                502,
            ),
            (UpstreamError::Timeout("slow".into()).into(), 504),
            (UpstreamError::Unavailable("down".into()).into(), 503),
            (UpstreamError::InvalidResponse("garbage".into()).into(), 503),
            (ExchangeError::Storage("disk full".into()), 500),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError(err).status().as_u16(), status);
        }
    }

    #[test]
    fn test_error_body_shape() {
        let err: ExchangeError = UpstreamError::Timeout("no response in 60s".into()).into();
        let body = serde_json::to_value(ErrorBody::from(&err)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "ok": false,
                "kind": "upstream_timeout",
                "retryable": true,
                "detail": "no response in 60s"
            })
        );
    }
}
