//! Retry policy shared by the hosted model providers
//!
//! Timeouts, connection failures, 429 and 5xx responses are retried with
//! exponential backoff until the configured time budget runs out. Every
//! other failure is permanent and surfaces immediately.

use crate::errors::AppError;
use backoff::ExponentialBackoff;
use reqwest::StatusCode;
use std::time::Duration;

/// Backoff schedule bounded by a total time budget
pub(crate) fn retry_policy(budget: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(250),
        max_interval: Duration::from_secs(8),
        max_elapsed_time: Some(budget),
        ..ExponentialBackoff::default()
    }
}

pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

pub(crate) fn is_transient_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Wrap an error for `backoff::future::retry`
pub(crate) fn classify(err: AppError, transient: bool) -> backoff::Error<AppError> {
    if transient {
        tracing::warn!(error = %err, "Upstream call failed, will retry");
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}
