//! Outbound delivery channels for threshold notifications.
//!
//! Each channel speaks one external surface (a recipient webhook, an HTTP
//! mail gateway) and classifies failures as transient or permanent at this
//! boundary so the dispatcher only has to decide whether to retry.

pub mod email;
pub mod webhook;

pub use email::EmailChannel;
pub use webhook::WebhookChannel;

use reqwest::StatusCode;
use thiserror::Error;

/// Delivery failure, classified by retry safety.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Retry-safe: timeouts, connection problems, 5xx-equivalent responses.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Retry-futile: invalid addresses, rejected payloads, 4xx responses.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Maps an HTTP response status to a failure class; `None` means success.
    pub(crate) fn from_status(status: StatusCode, channel: &'static str) -> Option<Self> {
        if status.is_success() {
            return None;
        }

        let detail = format!("{channel} endpoint responded with {status}");
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            Some(Self::Transient(detail))
        } else {
            Some(Self::Permanent(detail))
        }
    }

    /// Classifies a reqwest transport error. Anything that never reached the
    /// endpoint (connect, timeout) is retry-safe.
    pub(crate) fn from_reqwest(err: reqwest::Error, channel: &'static str) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient(format!("{channel} request failed: {err}"))
        } else {
            Self::Permanent(format!("{channel} request failed: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            let err = ChannelError::from_status(status, "webhook").expect("failure");
            assert!(err.is_transient(), "{status} should be transient");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
            StatusCode::GONE,
        ] {
            let err = ChannelError::from_status(status, "email").expect("failure");
            assert!(!err.is_transient(), "{status} should be permanent");
        }
    }

    #[test]
    fn success_statuses_produce_no_error() {
        assert!(ChannelError::from_status(StatusCode::OK, "webhook").is_none());
        assert!(ChannelError::from_status(StatusCode::ACCEPTED, "webhook").is_none());
    }
}
