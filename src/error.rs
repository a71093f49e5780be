use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{DlqEntryId, SubscriptionId};

/// Errors returned to callers of the dispatcher and its admin operations.
///
/// Per-job delivery failures never show up here. They surface through
/// dead-letter entries and subscription status instead.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,

    /// Job queue is full. Caller must retry or apply backoff.
    #[error("dispatcher at capacity")]
    Backpressure,

    /// A job with the same idempotency key is still being driven.
    #[error("delivery {0} is already in flight")]
    AlreadyInFlight(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("dead-letter entry not found: {0}")]
    DlqEntryNotFound(DlqEntryId),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Configuration(#[from] SigningError),

    /// The registry or dead-letter store could not be reached.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the persistence layer behind the registry and DLQ traits.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// Failure to produce a signature. Always fatal: nothing is sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SigningError {
    #[error("signature mode {mode} requires a non-empty secret")]
    MissingSecret { mode: &'static str },

    #[error("token signing failed: {0}")]
    Token(String),
}

/// Invalid dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success { status: u16 },
    RetryableFailure(FailureReason),
    FatalFailure(FailureReason),
}

impl DeliveryOutcome {
    /// Classify an HTTP response status.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => DeliveryOutcome::Success { status },
            300..=399 => DeliveryOutcome::RetryableFailure(FailureReason::Redirect { status }),
            429 => DeliveryOutcome::RetryableFailure(FailureReason::RateLimited),
            400..=499 => DeliveryOutcome::FatalFailure(FailureReason::ClientError { status }),
            _ => DeliveryOutcome::RetryableFailure(FailureReason::ServerError { status }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryOutcome::Success { status } => Some(*status),
            DeliveryOutcome::RetryableFailure(reason) | DeliveryOutcome::FatalFailure(reason) => {
                reason.status()
            }
        }
    }
}

/// Reasons why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Connect { message: String },
    Network { message: String },
    Redirect { status: u16 },
    RateLimited,
    ServerError { status: u16 },
    ClientError { status: u16 },
    Configuration { message: String },
}

impl FailureReason {
    pub fn status(&self) -> Option<u16> {
        match self {
            FailureReason::Redirect { status }
            | FailureReason::ServerError { status }
            | FailureReason::ClientError { status } => Some(*status),
            FailureReason::RateLimited => Some(429),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Connect { message } =>
                write!(f, "connection failed: {}", message),
            FailureReason::Network { message } =>
                write!(f, "network error: {}", message),
            FailureReason::Redirect { status } =>
                write!(f, "unexpected redirect (HTTP {})", status),
            FailureReason::RateLimited =>
                write!(f, "rate limited (HTTP 429)"),
            FailureReason::ServerError { status } =>
                write!(f, "remote endpoint returned error (HTTP {})", status),
            FailureReason::ClientError { status } =>
                write!(f, "client error, not retryable (HTTP {})", status),
            FailureReason::Configuration { message } =>
                write!(f, "configuration error: {}", message),
        }
    }
}

impl From<SigningError> for FailureReason {
    fn from(err: SigningError) -> Self {
        FailureReason::Configuration { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(DeliveryOutcome::from_status(200), DeliveryOutcome::Success { status: 200 });
        assert_eq!(DeliveryOutcome::from_status(204), DeliveryOutcome::Success { status: 204 });
        assert_eq!(
            DeliveryOutcome::from_status(301),
            DeliveryOutcome::RetryableFailure(FailureReason::Redirect { status: 301 })
        );
        assert_eq!(
            DeliveryOutcome::from_status(400),
            DeliveryOutcome::FatalFailure(FailureReason::ClientError { status: 400 })
        );
        assert_eq!(
            DeliveryOutcome::from_status(404),
            DeliveryOutcome::FatalFailure(FailureReason::ClientError { status: 404 })
        );
        assert_eq!(
            DeliveryOutcome::from_status(429),
            DeliveryOutcome::RetryableFailure(FailureReason::RateLimited)
        );
        assert_eq!(
            DeliveryOutcome::from_status(503),
            DeliveryOutcome::RetryableFailure(FailureReason::ServerError { status: 503 })
        );
    }

    #[test]
    fn outcome_reports_http_status() {
        assert_eq!(DeliveryOutcome::from_status(429).status(), Some(429));
        assert_eq!(DeliveryOutcome::RetryableFailure(FailureReason::Timeout).status(), None);
    }
}
