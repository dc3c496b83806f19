//! HTTP transport for batch uploads.
//!
//! A [`Transport`] performs exactly one POST; retry policy lives in the
//! delivery worker. [`UreqTransport`] is the production implementation and
//! treats every HTTP status as a response, never as an error, so the worker
//! sees the raw status code to classify.

#![allow(missing_docs)]

use std::time::Duration;

use thiserror::Error;

use crate::core::errors::BeaconError;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";
/// Header carrying the batch id, so the server can discard replays.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// One outbound request.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub url: &'a str,
    pub api_key: &'a str,
    pub idempotency_key: &'a str,
    pub body: &'a str,
}

/// Failure before any HTTP status was received.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint cannot be requested at all; retrying will not help.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network failure: {0}")]
    Network(String),
}

impl From<TransportError> for BeaconError {
    fn from(value: TransportError) -> Self {
        Self::Transport {
            details: value.to_string(),
        }
    }
}

pub trait Transport: Send + Sync {
    /// POST `request.body` and return the response status code.
    fn post(&self, request: &UploadRequest<'_>) -> Result<u16, TransportError>;
}

/// How the worker should treat a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// Permanent refusal; resending the same bytes cannot succeed.
    Rejected,
    Transient,
}

#[must_use]
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        408 | 429 => StatusClass::Transient,
        400..=499 => StatusClass::Rejected,
        _ => StatusClass::Transient,
    }
}

// ──────────────────── ureq ────────────────────

/// Blocking HTTPS transport on a shared `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent }
    }
}

impl Transport for UreqTransport {
    fn post(&self, request: &UploadRequest<'_>) -> Result<u16, TransportError> {
        let mut builder = self
            .agent
            .post(request.url)
            .header("Content-Type", "application/json")
            .header("User-Agent", concat!("usage-beacon/", env!("CARGO_PKG_VERSION")))
            .header(IDEMPOTENCY_HEADER, request.idempotency_key);
        if !request.api_key.is_empty() {
            builder = builder.header(API_KEY_HEADER, request.api_key);
        }
        match builder.send(request.body) {
            Ok(response) => Ok(response.status().as_u16()),
            Err(err) => Err(classify_ureq_error(err)),
        }
    }
}

fn classify_ureq_error(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::BadUri(details) => TransportError::InvalidUrl(details),
        ureq::Error::Http(details) => TransportError::InvalidUrl(details.to_string()),
        ureq::Error::Timeout(which) => TransportError::Timeout(which.to_string()),
        other => TransportError::Network(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        for status in [200, 201, 202, 204, 299] {
            assert_eq!(classify_status(status), StatusClass::Success, "{status}");
        }
        for status in [400, 401, 403, 404, 409, 413, 422] {
            assert_eq!(classify_status(status), StatusClass::Rejected, "{status}");
        }
        for status in [408, 429, 500, 502, 503, 504, 301, 100] {
            assert_eq!(classify_status(status), StatusClass::Transient, "{status}");
        }
    }

    #[test]
    fn malformed_url_fails_without_network() {
        let transport = UreqTransport::new(Duration::from_secs(1));
        let err = transport
            .post(&UploadRequest {
                url: "not a url",
                api_key: "k",
                idempotency_key: "b",
                body: "{}",
            })
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)), "{err:?}");
    }

    #[test]
    fn transport_error_maps_to_retryable_beacon_error() {
        let err: BeaconError = TransportError::Network("reset".to_string()).into();
        assert_eq!(err.code(), "UMB-3001");
        assert!(err.is_retryable());
    }
}
